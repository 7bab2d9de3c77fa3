use crate::client::XApiSession;
use crate::error::XApiError;
use crate::rpc::RpcValue;
use crate::types::{OpaqueRef, PowerState, Record};

use super::{
    expect_bool, expect_record, expect_ref, expect_refs, expect_string, expect_strings,
    map_uuid_miss, record_param, ref_param,
};

pub struct VmApi<'a> {
    pub(crate) session: &'a XApiSession,
}

impl VmApi<'_> {
    pub async fn all(&self) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self.session.call("VM.get_all", vec![]).await?;
        expect_refs("VM.get_all", value)
    }

    /// All real VMs: no templates, no snapshots, no control domains.
    pub async fn all_real(&self) -> Result<Vec<OpaqueRef>, XApiError> {
        let mut vms = Vec::new();
        for vm_ref in self.all().await? {
            if self.is_a_snapshot(&vm_ref).await?
                || self.is_a_template(&vm_ref).await?
                || self.is_control_domain(&vm_ref).await?
            {
                continue;
            }
            vms.push(vm_ref);
        }
        Ok(vms)
    }

    pub async fn by_uuid(&self, uuid: &str) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VM.get_by_uuid", vec![RpcValue::string(uuid)])
            .await
            .map_err(|e| map_uuid_miss("VM", uuid, e))?;
        expect_ref("VM.get_by_uuid", value)
    }

    /// Lookup by label, control domains filtered out.
    pub async fn by_label(&self, label: &str) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self
            .session
            .call("VM.get_by_name_label", vec![RpcValue::string(label)])
            .await?;
        let mut vms = Vec::new();
        for vm_ref in expect_refs("VM.get_by_name_label", value)? {
            if !self.is_control_domain(&vm_ref).await? {
                vms.push(vm_ref);
            }
        }
        Ok(vms)
    }

    pub async fn record(&self, vm: &OpaqueRef) -> Result<Record, XApiError> {
        let value = self.session.call("VM.get_record", vec![ref_param(vm)]).await?;
        expect_record("VM.get_record", value)
    }

    pub async fn create(&self, record: &Record) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VM.create", vec![record_param(record)])
            .await?;
        expect_ref("VM.create", value)
    }

    pub async fn destroy(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VM.destroy", vec![ref_param(vm)])
            .await
            .map(|_| ())
    }

    pub async fn uuid(&self, vm: &OpaqueRef) -> Result<String, XApiError> {
        let value = self.session.call("VM.get_uuid", vec![ref_param(vm)]).await?;
        expect_string("VM.get_uuid", value)
    }

    pub async fn label(&self, vm: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VM.get_name_label", vec![ref_param(vm)])
            .await?;
        expect_string("VM.get_name_label", value)
    }

    pub async fn set_label(&self, vm: &OpaqueRef, label: &str) -> Result<(), XApiError> {
        self.session
            .call(
                "VM.set_name_label",
                vec![ref_param(vm), RpcValue::string(label)],
            )
            .await
            .map(|_| ())
    }

    pub async fn is_a_snapshot(&self, vm: &OpaqueRef) -> Result<bool, XApiError> {
        let value = self
            .session
            .call("VM.get_is_a_snapshot", vec![ref_param(vm)])
            .await?;
        expect_bool("VM.get_is_a_snapshot", value)
    }

    pub async fn is_a_template(&self, vm: &OpaqueRef) -> Result<bool, XApiError> {
        let value = self
            .session
            .call("VM.get_is_a_template", vec![ref_param(vm)])
            .await?;
        expect_bool("VM.get_is_a_template", value)
    }

    pub async fn set_is_a_template(&self, vm: &OpaqueRef, value: bool) -> Result<(), XApiError> {
        self.session
            .call(
                "VM.set_is_a_template",
                vec![ref_param(vm), RpcValue::Bool(value)],
            )
            .await
            .map(|_| ())
    }

    pub async fn is_control_domain(&self, vm: &OpaqueRef) -> Result<bool, XApiError> {
        let value = self
            .session
            .call("VM.get_is_control_domain", vec![ref_param(vm)])
            .await?;
        expect_bool("VM.get_is_control_domain", value)
    }

    pub async fn power_state(&self, vm: &OpaqueRef) -> Result<PowerState, XApiError> {
        let value = self
            .session
            .call("VM.get_power_state", vec![ref_param(vm)])
            .await?;
        let raw = expect_string("VM.get_power_state", value)?;
        raw.parse::<PowerState>().map_err(XApiError::from)
    }

    pub async fn allowed_operations(&self, vm: &OpaqueRef) -> Result<Vec<String>, XApiError> {
        let value = self
            .session
            .call("VM.get_allowed_operations", vec![ref_param(vm)])
            .await?;
        expect_strings("VM.get_allowed_operations", value)
    }

    /// Whether a live export is currently permitted.
    pub async fn can_export(&self, vm: &OpaqueRef) -> Result<bool, XApiError> {
        Ok(self
            .allowed_operations(vm)
            .await?
            .iter()
            .any(|op| op == "export"))
    }

    pub async fn snapshots(&self, vm: &OpaqueRef) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self
            .session
            .call("VM.get_snapshots", vec![ref_param(vm)])
            .await?;
        expect_refs("VM.get_snapshots", value)
    }

    pub async fn snapshot_of(&self, vm: &OpaqueRef) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call("VM.get_snapshot_of", vec![ref_param(vm)])
            .await?;
        expect_ref("VM.get_snapshot_of", value)
    }

    /// Snapshot timestamp, verbatim wire text.
    pub async fn snapshot_time(&self, vm: &OpaqueRef) -> Result<String, XApiError> {
        let value = self
            .session
            .call("VM.get_snapshot_time", vec![ref_param(vm)])
            .await?;
        expect_string("VM.get_snapshot_time", value)
    }

    pub async fn snapshot(&self, vm: &OpaqueRef, new_label: &str) -> Result<OpaqueRef, XApiError> {
        let value = self
            .session
            .call(
                "VM.snapshot",
                vec![ref_param(vm), RpcValue::string(new_label)],
            )
            .await?;
        expect_ref("VM.snapshot", value)
    }

    pub async fn vbds(&self, vm: &OpaqueRef) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self.session.call("VM.get_VBDs", vec![ref_param(vm)]).await?;
        expect_refs("VM.get_VBDs", value)
    }

    pub async fn vifs(&self, vm: &OpaqueRef) -> Result<Vec<OpaqueRef>, XApiError> {
        let value = self.session.call("VM.get_VIFs", vec![ref_param(vm)]).await?;
        expect_refs("VM.get_VIFs", value)
    }

    /// VBDs of type `Disk` only.
    pub async fn disk_vbds(&self, vm: &OpaqueRef) -> Result<Vec<OpaqueRef>, XApiError> {
        let mut disks = Vec::new();
        for vbd_ref in self.vbds(vm).await? {
            if self.session.vbd().type_of(&vbd_ref).await? == "Disk" {
                disks.push(vbd_ref);
            }
        }
        Ok(disks)
    }

    /// Disk VDIs paired with their VBDs; VBDs carrying the null VDI
    /// sentinel (empty drives) are skipped.
    pub async fn disk_vdis_with_vbds(
        &self,
        vm: &OpaqueRef,
    ) -> Result<Vec<(OpaqueRef, OpaqueRef)>, XApiError> {
        let mut pairs = Vec::new();
        for vbd_ref in self.disk_vbds(vm).await? {
            if let Some(vdi_ref) = self.session.vbd().vdi(&vbd_ref).await?.as_option() {
                pairs.push((vdi_ref.clone(), vbd_ref));
            }
        }
        Ok(pairs)
    }

    pub async fn disk_vdis(&self, vm: &OpaqueRef) -> Result<Vec<OpaqueRef>, XApiError> {
        Ok(self
            .disk_vdis_with_vbds(vm)
            .await?
            .into_iter()
            .map(|(vdi_ref, _)| vdi_ref)
            .collect())
    }

    pub async fn start(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call(
                "VM.start",
                vec![ref_param(vm), RpcValue::Bool(false), RpcValue::Bool(false)],
            )
            .await
            .map(|_| ())
    }

    pub async fn shutdown(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VM.shutdown", vec![ref_param(vm)])
            .await
            .map(|_| ())
    }

    pub async fn pause(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VM.pause", vec![ref_param(vm)])
            .await
            .map(|_| ())
    }

    pub async fn unpause(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VM.unpause", vec![ref_param(vm)])
            .await
            .map(|_| ())
    }

    pub async fn suspend(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call("VM.suspend", vec![ref_param(vm)])
            .await
            .map(|_| ())
    }

    pub async fn resume(&self, vm: &OpaqueRef) -> Result<(), XApiError> {
        self.session
            .call(
                "VM.resume",
                vec![ref_param(vm), RpcValue::Bool(false), RpcValue::Bool(false)],
            )
            .await
            .map(|_| ())
    }

    /// Converge the VM onto a target power state, routing through the
    /// intermediate transitions the API requires.
    pub async fn set_power_state(
        &self,
        vm: &OpaqueRef,
        target: PowerState,
    ) -> Result<(), XApiError> {
        let current = self.power_state(vm).await?;
        if current == target {
            return Ok(());
        }

        if target == PowerState::Halted {
            return self.shutdown(vm).await;
        }

        match current {
            PowerState::Halted => self.start(vm).await?,
            PowerState::Paused => self.unpause(vm).await?,
            PowerState::Suspended => self.resume(vm).await?,
            PowerState::Running => {}
        }

        match target {
            PowerState::Paused => self.pause(vm).await,
            PowerState::Suspended => self.suspend(vm).await,
            _ => Ok(()),
        }
    }
}
