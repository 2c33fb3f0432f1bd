//! Interlock status view
//!
//! Derived values computed from the status tag's published items: the
//! controller clock and the per-subsystem interlock summaries.

use std::sync::Arc;

use serde::Serialize;

use crate::registry::ConnectionRegistry;
use crate::store::{TagValue, ValueStore};
use crate::tag::attribute_name;

/// Status tag name used when none was detected at connect
pub const DEFAULT_STATUS_TAG: &str = "GIC_to_OCS";

pub const ITEM_COMM_FAULT: &str = "commFault";
pub const ITEM_PLC_SYSTEM_FAULT: &str = "plcSystemFault";
pub const ITEM_PLC_ERR_CODE_MAJOR: &str = "plcErrCodeMajor";
pub const ITEM_GIC_IO_STATUS: &str = "GicIO_Status";

const TIME_ITEMS: [&str; 7] = [
    "timeYear",
    "timeMonth",
    "timeDay",
    "timeHour",
    "timeMin",
    "timeSec",
    "timeMs",
];

const GIC_ITEMS: &[&str] = &[
    "EStop_OK",
    "EncAz_Ready",
    "EncAlt_Ready",
    "TelAlt_Ready",
    "TelAz_Ready",
    "Rot_Ready",
    "GIC_Run",
    "EncLIC_Run",
    "FacLIC_Run",
    "InstLIC_Run",
    "OSSLIC_Run",
    "Rot_Run",
    "TelLIC_Run",
    "FTSLIC_Run",
    "GicIO_Status",
    "EncAlt_TrappedKey",
    "EncAz_TrappedKey",
    "TelAlt_TrappedKey",
    "TelAz_TrappedKey",
    "Rot_TrappedKey",
];

const ENC_ITEMS: &[&str] = &[
    "EncEStop_OK",
    "EncIO_Status",
    "EncAzCableOverTension_OK",
    "EncAltCableOverTension_OK",
    "EncAz_MotionStopped",
    "EncAz_SafeSpeedLimit",
    "EncAz_NegFinalLimit",
    "EncAz_PosFinalLimit",
    "EncAlt_MotionStopped",
    "EncElevation_NegFinalLimit",
    "EncElevation_PosFinalLimit",
    "EncAperture_Closed",
    "EncBridgeCrane_Stowed",
    "EncJibCrane_Stowed",
    "EncTEOAPlatform_Stowed",
    "EncAz_AlignLift",
    "EncTransferBridge_Stowed",
];

const ROT_ITEMS: &[&str] = &[
    "RotEStop_OK",
    "RotIO_Status",
    "Rot_MotionStopped",
    "RotSafeLim_Speed",
    "Rot_CCWLimit",
    "Rot_CWLimit",
    "RotOver_Speed",
];

const OSS_ITEMS: &[&str] = &["OSSIO_Status"];

const FAC_ITEMS: &[&str] = &[
    "FacEStop_OK",
    "FacIO_Status",
    "FacFireAlarm_OK",
    "FacSeismicAlarm_OK",
    "FacInnerPierHazardZone_Locked",
    "FacMezzLevelHazardZone_Locked",
    "FacCoudeLabHazardZone_Locked",
    "FacUtilityLevelHazardZone_Locked",
    "FacCatwalkHazardZone_Locked",
    "FacServiceRingHazardZone_Locked",
    "FacEnclosureFloorHazardZone_Locked",
    "FacTelescopeHazardZone_Locked",
    "FacUpperEncHazardZone_Locked",
    "FacBoomLift_NotStowed",
    "FacBoomLift_Permissive",
    "FacCoudeLabCrane_Stowed",
    "FacCoudeLabCrane_Permissive",
    "FacPFlowLift_Stowed",
    "FacPFlowLift_Permissive",
    "FacPFlowRoofLatch_Closed",
];

const INST_ITEMS: &[&str] = &["InstIO_Status"];

const TEL_ITEMS: &[&str] = &[
    "TelEStop_OK",
    "TelIO_Status",
    "M1Az_MaintenancePos",
    "M1Alt_MaintenancePos",
    "TEOAAz_MaintenancePos",
    "TEOAAlt_MaintenancePos",
    "TelAz_MotionStopped",
    "TelAz_SafeSpeed",
    "TelAz_NegFinalLimit",
    "TelAz_PosFinalLimit",
    "TelAlt_MotionStopped",
    "TelAlt_SafeSpeed",
    "TelAlt_NegFinalLimit",
    "TelAlt_PosFinalLimit",
    "TelAz_CableWrapStopped",
    "TelAz_CableWrapMisaligned",
    "TelAz_CableWrapOverTension",
    "TelAz_OverSpeed",
    "TelAlt_OverSpeed",
    "OSSBridge_Stowed",
    "OSSBridge_Permissive",
    "M5Bridge_Stowed",
    "M5Bridge_Permissive",
    "TelAccessDoors_NotClosed",
    "M1CartJacks_Stowed",
    "M1Cover_Closed",
    "M1Cover_Permissive",
];

const FTS_ITEMS: &[&str] = &["FTSIO_Status"];

/// Subsystem whose interlock chain is summarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InterlockGroup {
    Gic,
    Enc,
    Rot,
    Oss,
    Fac,
    Inst,
    Tel,
    Fts,
}

impl InterlockGroup {
    pub const ALL: [InterlockGroup; 8] = [
        InterlockGroup::Gic,
        InterlockGroup::Enc,
        InterlockGroup::Rot,
        InterlockGroup::Oss,
        InterlockGroup::Fac,
        InterlockGroup::Inst,
        InterlockGroup::Tel,
        InterlockGroup::Fts,
    ];

    /// Status-tag items that must all be true for the group to be clear
    pub fn items(&self) -> &'static [&'static str] {
        match self {
            InterlockGroup::Gic => GIC_ITEMS,
            InterlockGroup::Enc => ENC_ITEMS,
            InterlockGroup::Rot => ROT_ITEMS,
            InterlockGroup::Oss => OSS_ITEMS,
            InterlockGroup::Fac => FAC_ITEMS,
            InterlockGroup::Inst => INST_ITEMS,
            InterlockGroup::Tel => TEL_ITEMS,
            InterlockGroup::Fts => FTS_ITEMS,
        }
    }

    /// Item name the summary is published under, e.g. `GIC_Interlock_Status`
    pub fn status_item(&self) -> &'static str {
        match self {
            InterlockGroup::Gic => "GIC_Interlock_Status",
            InterlockGroup::Enc => "ENC_Interlock_Status",
            InterlockGroup::Rot => "ROT_Interlock_Status",
            InterlockGroup::Oss => "OSS_Interlock_Status",
            InterlockGroup::Fac => "FAC_Interlock_Status",
            InterlockGroup::Inst => "INST_Interlock_Status",
            InterlockGroup::Tel => "TEL_Interlock_Status",
            InterlockGroup::Fts => "FTS_Interlock_Status",
        }
    }
}

/// Read-only view over the status tag's values in the store
#[derive(Debug, Clone)]
pub struct GisStatusView {
    registry: Arc<ConnectionRegistry>,
}

impl GisStatusView {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn status_tag(&self) -> String {
        self.registry
            .status_tag_name()
            .unwrap_or_else(|| DEFAULT_STATUS_TAG.to_string())
    }

    fn store(&self) -> &dyn ValueStore {
        self.registry.store().as_ref()
    }

    fn item(&self, item: &str) -> Option<TagValue> {
        self.store().get(&attribute_name(&self.status_tag(), item))
    }

    fn flag(&self, item: &str) -> bool {
        self.item(item).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Controller clock as `YYYY/MM/DD hh:mm:ss.mmm`
    pub fn plc_time(&self) -> Option<String> {
        let mut parts = [0i64; 7];
        for (slot, item) in parts.iter_mut().zip(TIME_ITEMS) {
            *slot = self.item(item)?.as_int()?;
        }
        let [year, month, day, hour, min, sec, ms] = parts;
        Some(format!(
            "{:04}/{:02}/{:02} {:02}:{:02}:{:02}.{:03}",
            year, month, day, hour, min, sec, ms
        ))
    }

    /// True when every item of the group is set; missing items count as unset
    pub fn interlock_status(&self, group: InterlockGroup) -> bool {
        let status_tag = self.status_tag();
        group.items().iter().all(|item| {
            self.store()
                .get(&attribute_name(&status_tag, item))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
    }

    /// Store every group's summary under the status tag
    pub fn publish_interlock_status(&self) -> Vec<(String, TagValue)> {
        let status_tag = self.status_tag();
        let values: Vec<(String, TagValue)> = InterlockGroup::ALL
            .iter()
            .map(|group| {
                (
                    attribute_name(&status_tag, group.status_item()),
                    TagValue::Bool(self.interlock_status(*group)),
                )
            })
            .collect();
        self.store().set_all(&values);
        values
    }

    pub fn comm_fault(&self) -> bool {
        self.flag(ITEM_COMM_FAULT)
    }

    pub fn plc_system_fault(&self) -> bool {
        self.flag(ITEM_PLC_SYSTEM_FAULT)
    }

    pub fn plc_err_major(&self) -> Option<i64> {
        self.item(ITEM_PLC_ERR_CODE_MAJOR).and_then(|v| v.as_int())
    }

    pub fn gic_connection_status(&self) -> bool {
        self.flag(ITEM_GIC_IO_STATUS)
    }

    pub fn is_simulated(&self) -> bool {
        self.registry.is_simulated()
    }
}
