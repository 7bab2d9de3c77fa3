use crate::client::XApiSession;
use crate::error::XApiError;
use crate::rpc::RpcValue;
use crate::types::OpaqueRef;

use super::{expect_ref, expect_refs, expect_string, map_uuid_miss, ref_param};

pub struct SrApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl SrApi<'_> {
    pub async fn all(&self) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self.session.call("SR.get_all", vec![]).await?;
        expect_refs("SR.get_all", value)
    }

    pub async fn by_uuid(&self, uuid: &str) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("SR.get_by_uuid", vec![RpcValue::string(uuid)])
            .await
            .map_err(|e| map_uuid_miss("SR", uuid, e))?;
        expect_ref("SR.get_by_uuid", value)
    }

    pub async fn by_label(&self, label: &str) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self
            .session
            .call("SR.get_by_name_label", vec![RpcValue::string(label)])
            .await?;
        expect_refs("SR.get_by_name_label", value)
    }

    pub async fn label(&self, sr: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("SR.get_name_label", vec![ref_param(sr)])
            .await?;
        expect_string("SR.get_name_label", value)
    }

    /// Whether the reference still resolves on this pool.
    pub async fn exists(&self, sr: &OpaqueRef) -> Result<bool, XApiError> {
        Ok(self.all().await?.contains(sr))
    }
}
