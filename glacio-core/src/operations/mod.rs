mod archive;
mod bundle;
mod delete_entry;
mod free_local;
mod list_entries;
mod reconcile;
mod report_status;
mod restore;

pub use archive::{
    ArchiveOperation, ArchiveOperationRequest, ArchiveOptions, ArchiveReport, UnitOutcome,
    WHERE_DID_THE_FILES_GO,
};
pub use bundle::{BUNDLE_OBJECT_NAME, BundlingConfig, TransferUnit, plan_units};
pub use delete_entry::{DeleteEntryOperation, DeleteEntryOperationRequest};
pub use free_local::{FreeLocalOperation, FreeLocalOperationRequest, FreeLocalReport, FreeOutcome};
pub use list_entries::ListEntriesOperation;
pub use reconcile::{
    PollOutcome, ReconcileOperation, ReconcileOperationRequest, ReconcileReport, ReconciledRestore,
};
pub use report_status::{ReportStatusOperation, StatusReport, TierSummary};
pub use restore::{RestoreOperation, RestoreOperationRequest, RestoreOptions, RestoreOutcome};
