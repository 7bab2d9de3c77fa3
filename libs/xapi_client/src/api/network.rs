use crate::client::XApiSession;
use crate::error::XApiError;
use crate::rpc::RpcValue;
use crate::types::OpaqueRef;

use super::{expect_refs, expect_string, map_uuid_miss, ref_param};

pub struct NetworkApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl NetworkApi<'_> {
    pub async fn all(&self) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self.session.call("network.get_all", vec![]).await?;
        expect_refs("network.get_all", value)
    }

    pub async fn by_uuid(&self, uuid: &str) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("network.get_by_uuid", vec![RpcValue::string(uuid)])
            .await
            .map_err(|e| map_uuid_miss("network", uuid, e))?;
        super::expect_ref("network.get_by_uuid", value)
    }

    pub async fn by_label(&self, label: &str) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self
            .session
            .call("network.get_by_name_label", vec![RpcValue::string(label)])
            .await?;
        expect_refs("network.get_by_name_label", value)
    }

    pub async fn label(&self, network: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("network.get_name_label", vec![ref_param(network)])
            .await?;
        expect_string("network.get_name_label", value)
    }

    /// Whether the reference still resolves on this pool.
    pub async fn exists(&self, network: &OpaqueRef) -> Result<bool, XApiError> {
        Ok(self.all().await?.contains(network))
    }
}
