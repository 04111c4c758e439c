/// Root prefix of the archive queue in object storage
pub const QUEUE_ROOT: &str = "metrics-logs";

/// Date encoded in archive file names
pub const ARCHIVE_DATE_FORMAT: &str = "%d%m%Y";

/// Date format written to `date_metric`
pub const METRIC_DATE_FORMAT: &str = "%Y-%m-%d";

pub const VISITS_TABLE_PREFIX: &str = "visits_";

pub const MATOMO_REUSES_TABLE: &str = "matomo_reuses";
pub const MATOMO_ORGANIZATIONS_TABLE: &str = "matomo_organizations";

/// Fixed count columns, in table order, preceding the named-segment columns
pub const COUNT_COLUMNS: [&str; 4] = [
    "nb_visit_static",
    "nb_visit",
    "nb_visit_apis",
    "nb_visit_total",
];

/// Scratch sub-directories
pub const CATALOG_DIR: &str = "catalogs";
pub const ARCHIVE_DIR: &str = "archives";
pub const FOUND_DIR: &str = "found";
/// Owned by the outlink command, which may run alongside a log run
pub const MATOMO_DIR: &str = "matomo";
