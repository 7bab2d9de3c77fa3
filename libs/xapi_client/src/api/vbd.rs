use crate::client::XApiSession;
use crate::error::XApiError;
use crate::types::{OpaqueRef, Record};

use super::{expect_record, expect_ref, expect_string, record_param, ref_param};

pub struct VbdApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl VbdApi<'_> {
    pub async fn record(&self, vbd: &OpaqueRef) -> Result<Record, XApiError> {
        let value = self
            .session
            .call("VBD.get_record", vec![ref_param(vbd)])
            .await?;
        expect_record("VBD.get_record", value)
    }

    /// `Disk`, `CD`, `Floppy`.
    pub async fn type_of(&self, vbd: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VBD.get_type", vec![ref_param(vbd)])
            .await?;
        expect_string("VBD.get_type", value)
    }

    /// The attached VDI; may be the null sentinel for empty drives.
    pub async fn vdi(&self, vbd: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VBD.get_VDI", vec![ref_param(vbd)])
            .await?;
        expect_ref("VBD.get_VDI", value)
    }

    pub async fn vm(&self, vbd: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self.session.call("VBD.get_VM", vec![ref_param(vbd)]).await?;
        expect_ref("VBD.get_VM", value)
    }

    pub async fn create(&self, record: &Record) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VBD.create", vec![record_param(record)])
            .await?;
        expect_ref("VBD.create", value)
    }
}
