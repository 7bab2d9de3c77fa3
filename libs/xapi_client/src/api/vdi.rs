use crate::client::XApiSession;
use crate::error::XApiError;
use crate::types::{OpaqueRef, Record};

use super::{expect_record, expect_ref, expect_string, record_param, ref_param};

pub struct VdiApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl VdiApi<'_> {
    pub async fn record(&self, vdi: &OpaqueRef) -> Result<Record, XApiError> {
        let value = self
            .session
            .call("VDI.get_record", vec![ref_param(vdi)])
            .await?;
        expect_record("VDI.get_record", value)
    }

    pub async fn uuid(&self, vdi: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VDI.get_uuid", vec![ref_param(vdi)])
            .await?;
        expect_string("VDI.get_uuid", value)
    }

    pub async fn label(&self, vdi: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VDI.get_name_label", vec![ref_param(vdi)])
            .await?;
        expect_string("VDI.get_name_label", value)
    }

    pub async fn snapshot_of(&self, vdi: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VDI.get_snapshot_of", vec![ref_param(vdi)])
            .await?;
        expect_ref("VDI.get_snapshot_of", value)
    }

    /// Snapshot timestamp, verbatim wire text.
    pub async fn snapshot_time(&self, vdi: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VDI.get_snapshot_time", vec![ref_param(vdi)])
            .await?;
        expect_string("VDI.get_snapshot_time", value)
    }

    pub async fn sr(&self, vdi: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self.session.call("VDI.get_SR", vec![ref_param(vdi)]).await?;
        expect_ref("VDI.get_SR", value)
    }

    pub async fn create(&self, record: &Record) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VDI.create", vec![record_param(record)])
            .await?;
        expect_ref("VDI.create", value)
    }

    pub async fn destroy(&self, vdi: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VDI.destroy", vec![ref_param(vdi)])
            .await
            .map(|_| ())
    }
}
