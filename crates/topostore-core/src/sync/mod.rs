//! # Sync Protocol Codec
//!
//! Serialization of graph deltas between collector and aggregator processes.
//!
//! Every message travels as an `Envelope` `{"type", "payload"}`. `Message`
//! gives the payload its typed form:
//!
//! | Tag                                      | Payload                        |
//! |------------------------------------------|--------------------------------|
//! | `SyncRequest`                            | `{TimeSlice?, GremlinFilter}`  |
//! | `Sync`, `SyncReply`                      | `{Nodes, Edges}`               |
//! | `OriginGraphDeleted`                     | `"<service>.<host>"`           |
//! | `NodeAdded`, `NodeUpdated`, `NodeDeleted` | node record                   |
//! | `EdgeAdded`, `EdgeUpdated`, `EdgeDeleted` | edge record                   |
//!
//! The codec does not define a transport.

mod envelope;
mod message;

pub use envelope::Envelope;
pub use message::{Message, SyncRequest, SyncSnapshot};
