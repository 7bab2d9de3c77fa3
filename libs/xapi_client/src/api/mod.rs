//! Typed facades over the raw session, one per hypervisor class.
//! References stay opaque; the null sentinel never leaks past this layer.

pub mod network;
pub mod pool;
pub mod sr;
pub mod task;
pub mod vbd;
pub mod vdi;
pub mod vif;
pub mod vm;

use crate::client::XApiSession;
use crate::error::XApiError;
use crate::rpc::RpcValue;
use crate::types::{OpaqueRef, Record};

impl XApiSession {
    pub fn vm(&self) -> vm::VmApi<'_> {
        vm::VmApi { session: self }
    }

    pub fn vbd(&self) -> vbd::VbdApi<'_> {
        vbd::VbdApi { session: self }
    }

    pub fn vdi(&self) -> vdi::VdiApi<'_> {
        vdi::VdiApi { session: self }
    }

    pub fn vif(&self) -> vif::VifApi<'_> {
        vif::VifApi { session: self }
    }

    pub fn network(&self) -> network::NetworkApi<'_> {
        network::NetworkApi { session: self }
    }

    pub fn sr(&self) -> sr::SrApi<'_> {
        sr::SrApi { session: self }
    }

    pub fn task(&self) -> task::TaskApi<'_> {
        task::TaskApi { session: self }
    }

    pub fn pool(&self) -> pool::PoolApi<'_> {
        pool::PoolApi { session: self }
    }
}

pub(crate) fn expect_string(method: &str, value: RpcValue) -> Result<String, XApiError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| XApiError::Transport(format!("{} returned a non-string value", method)))
}

pub(crate) fn expect_ref(method: &str, value: RpcValue) -> Result<OpaqueRef, XApiError> {
    expect_string(method, value).map(OpaqueRef::from)
}

pub(crate) fn expect_refs(method: &str, value: RpcValue) -> Result<Vec<OpaqueRef>, XApiError> {
    let items = value
        .into_array()
        .ok_or_else(|| XApiError::Transport(format!("{} returned a non-array value", method)))?;
    items
        .into_iter()
        .map(|item| expect_ref(method, item))
        .collect()
}

pub(crate) fn expect_strings(method: &str, value: RpcValue) -> Result<Vec<String>, XApiError> {
    let items = value
        .into_array()
        .ok_or_else(|| XApiError::Transport(format!("{} returned a non-array value", method)))?;
    items
        .into_iter()
        .map(|item| expect_string(method, item))
        .collect()
}

pub(crate) fn expect_bool(method: &str, value: RpcValue) -> Result<bool, XApiError> {
    value
        .as_bool()
        .ok_or_else(|| XApiError::Transport(format!("{} returned a non-boolean value", method)))
}

pub(crate) fn expect_record(method: &str, value: RpcValue) -> Result<Record, XApiError> {
    match value.into_json() {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(XApiError::Transport(format!(
            "{} returned a non-record value",
            method
        ))),
    }
}

/// Lookup failures for a uuid surface as `NotFound` so callers can skip
/// the missing object instead of aborting the run.
pub(crate) fn map_uuid_miss(
    class: &'static str,
    uuid: &str,
    error: XApiError,
) -> XApiError {
    match &error {
        XApiError::Failure { code, .. } if code == "UUID_INVALID" || code == "HANDLE_INVALID" => {
            XApiError::NotFound {
                class,
                ident: uuid.to_string(),
            }
        }
        _ => error,
    }
}

pub(crate) fn ref_param(reference: &OpaqueRef) -> RpcValue {
    RpcValue::string(reference.as_str())
}

pub(crate) fn record_param(record: &Record) -> RpcValue {
    RpcValue::from_json(serde_json::Value::Object(record.clone()))
}
