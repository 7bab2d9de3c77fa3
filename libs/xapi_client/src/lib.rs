//! Client library for the XenAPI XML-RPC surface and the bulk
//! import/export HTTP endpoints of a XenServer/XCP-ng pool master.

pub mod api;
pub mod cancel;
pub mod client;
pub mod error;
pub mod rpc;
pub mod transfer;
pub mod types;

pub use cancel::CancelToken;
pub use client::XApiSession;
pub use error::{TransferError, XApiError};
pub use types::{OpaqueRef, PowerState, Record, RecordExt};
