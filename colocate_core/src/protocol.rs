//! Command and header names shared by both peers.
//!
//! Names are part of the wire format; peers built from other code bases
//! match on these exact strings.

/// Session traffic: `{localizer_id: uuid, header: string, field}`
pub const LOCALIZATION_DATA: &str = "LocalizationData";

/// Ask the peer to run a localizer against us: `{localizer_id, settings}`
pub const LOCALIZE: &str = "Localize";

/// Reply to [`LOCALIZE`]: `{localizer_id, success: bool}`
pub const LOCALIZE_COMPLETE: &str = "LocalizeComplete";

/// Result of a local localization: `{localizer_id, located, coordinate_id, pose}`
pub const COORDINATE_STATE: &str = "CoordinateState";

pub const SUPPORTED_LOCALIZERS_REQUEST: &str = "SupportedLocalizersRequest";

/// `{count: u32, ids: [uuid]}`
pub const SUPPORTED_LOCALIZERS: &str = "SupportedLocalizers";

/// Session header: `{max_supported_id: i32}`
pub const DISCOVERY_REQUEST: &str = "DiscoveryRequest";

/// Session header: `{id: string}`
pub const COORDINATE_ASSIGNED: &str = "CoordinateAssigned";

/// Session header: `{id: string}`
pub const COORDINATE_FOUND: &str = "CoordinateFound";
