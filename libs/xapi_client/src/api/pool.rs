use crate::client::XApiSession;
use crate::error::XApiError;
use crate::types::OpaqueRef;

use super::{expect_ref, expect_refs, expect_string, ref_param};

pub struct PoolApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl PoolApi<'_> {
    /// The pool object this master belongs to.
    pub async fn this(&self) -> Result<OpaqueRef, XApiError> {
        let value = self.session.call("pool.get_all", vec![]).await?;
        let pools = expect_refs("pool.get_all", value)?;
        pools.into_iter().next().ok_or(XApiError::NotFound {
            class: "pool",
            ident: "host is not a pool member".to_string(),
        })
    }

    pub async fn label(&self) -> Result<String, XApiError> {
        let pool = self.this().await?;
        let value = self
            .session
            .call("pool.get_name_label", vec![ref_param(&pool)])
            .await?;
        expect_string("pool.get_name_label", value)
    }

    pub async fn default_sr(&self) -> Result<OpaqueRef, XApiError> {
        let pool = self.this().await?;
        let value = self
            .session
            .call("pool.get_default_SR", vec![ref_param(&pool)])
            .await?;
        expect_ref("pool.get_default_SR", value)
    }

    /// Fallback network for interfaces whose original network is gone.
    pub async fn default_network(&self) -> Result<OpaqueRef, XApiError> {
        let networks = self.session.network().all().await?;
        networks.into_iter().next().ok_or(XApiError::NotFound {
            class: "network",
            ident: "pool has no networks".to_string(),
        })
    }
}
