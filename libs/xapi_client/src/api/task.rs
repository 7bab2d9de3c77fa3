use crate::client::XApiSession;
use crate::error::XApiError;
use crate::rpc::RpcValue;
use crate::types::OpaqueRef;

use super::{expect_ref, expect_string, ref_param};

pub struct TaskApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl TaskApi<'_> {
    /// Create a task handle to attach to a bulk-transfer URL.
    pub async fn create(&self, label: &str, description: &str) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call(
                "task.create",
                vec![RpcValue::string(label), RpcValue::string(description)],
            )
            .await?;
        expect_ref("task.create", value)
    }

    pub async fn cancel(&self, task: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("task.cancel", vec![ref_param(task)])
            .await
            .map(|_| ())
    }

    pub async fn status(&self, task: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("task.get_status", vec![ref_param(task)])
            .await?;
        expect_string("task.get_status", value)
    }
}
