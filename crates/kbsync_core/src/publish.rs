use tracing::error;

use crate::diagnostics::{DiagnosticsLog, steps};
use crate::settings::SyncMode;

pub const STATUS_ONLINE: &str = "Online";
pub const STATUS_ARCHIVED: &str = "Archived";

/// Publish state is recomputed from scratch on every sync; there is no
/// incremental transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Published,
    Unpublished,
}

impl PublishState {
    pub fn is_published(self) -> bool {
        self == Self::Published
    }
}

/// Error codes publish only when the source says Online and the
/// causes/solutions content survived normalization non-empty. An Archived
/// status is checked unconditionally last, so it always wins.
pub fn derive_error_code_state(
    publish_status: &str,
    causes_empty: bool,
    external_id: &str,
    diagnostics: &mut DiagnosticsLog,
) -> PublishState {
    let mut state = PublishState::Unpublished;
    if publish_status == STATUS_ONLINE && !causes_empty {
        state = PublishState::Published;
        diagnostics.record_success(external_id, steps::PUBLICATION);
    } else if causes_empty {
        error!(external_id, "causes/solutions content is empty");
        diagnostics.record_failure(
            external_id,
            steps::PUBLICATION,
            "causes/solutions content is empty",
        );
    }
    if publish_status == STATUS_ARCHIVED {
        state = PublishState::Unpublished;
        diagnostics.record_failure(
            external_id,
            steps::PUBLICATION,
            "document unpublished (source status is Archived)",
        );
    }
    state
}

pub struct TechnotePublishInputs<'a> {
    pub publish_status: &'a str,
    pub details_empty: bool,
    pub server_type_resolved: bool,
    pub product_type_resolved: bool,
    pub mode: SyncMode,
}

/// Technotes additionally gate on taxonomy resolution in production: both
/// variant terms missing forces Unpublished, while a single resolved term
/// is enough to publish. Archived again wins unconditionally.
pub fn derive_technote_state(
    inputs: &TechnotePublishInputs<'_>,
    external_id: &str,
    diagnostics: &mut DiagnosticsLog,
) -> PublishState {
    let production = inputs.mode == SyncMode::Production;
    let any_type_resolved = inputs.server_type_resolved || inputs.product_type_resolved;

    let mut state = PublishState::Unpublished;
    if production && !any_type_resolved {
        error!(external_id, "server/product type terms are not present in the taxonomy");
        diagnostics.record_failure(
            external_id,
            steps::PUBLICATION,
            "server/product type terms are not present in the taxonomy",
        );
    } else if inputs.details_empty {
        error!(external_id, "details content is empty");
        diagnostics.record_failure(external_id, steps::PUBLICATION, "details content is empty");
    } else if inputs.publish_status == STATUS_ONLINE || (production && any_type_resolved) {
        state = PublishState::Published;
        diagnostics.record_success(external_id, steps::PUBLICATION);
    }

    if inputs.publish_status == STATUS_ARCHIVED {
        state = PublishState::Unpublished;
        diagnostics.record_failure(
            external_id,
            steps::PUBLICATION,
            "document unpublished (source status is Archived)",
        );
    }
    state
}
