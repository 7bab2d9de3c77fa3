use crate::client::XApiSession;
use crate::error::XApiError;
use crate::types::{OpaqueRef, Record};

use super::{expect_record, expect_ref, record_param, ref_param};

pub struct VifApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl VifApi<'_> {
    pub async fn record(&self, vif: &OpaqueRef) -> Result<Record, XApiError> {
        let value = self
            .session
            .call("VIF.get_record", vec![ref_param(vif)])
            .await?;
        expect_record("VIF.get_record", value)
    }

    pub async fn network(&self, vif: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VIF.get_network", vec![ref_param(vif)])
            .await?;
        expect_ref("VIF.get_network", value)
    }

    pub async fn create(&self, record: &Record) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VIF.create", vec![record_param(record)])
            .await?;
        expect_ref("VIF.create", value)
    }
}
