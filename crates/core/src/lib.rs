pub mod calibration;
pub mod catalog;
pub mod config;
pub mod detection;
pub mod fits;
pub mod input;
pub mod matching;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod reference;
pub mod sky;
pub mod testing;
pub mod wcs;

pub use calibration::{
    AstrometryNetClient, CalibrationConfig, CalibrationError, CalibrationOutcome,
    CalibrationService, CalibrationSolution,
};
pub use catalog::{
    build_backends, AggregatedCatalog, CatalogAggregator, CatalogBackend, CatalogConfig,
    CatalogEntry, CatalogError, CatalogSource, CatalogTag, SkyRegion,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use detection::{
    BlobDetector, DetectedSource, DetectionConfig, DetectionError, DetectionReport,
    SourceDetector,
};
pub use input::SourceImage;
pub use matching::{match_pixels, match_sky, Match, MatchPartition};
pub use orchestrator::{
    BranchResult, BranchStatus, OrchestratorError, ParallelOrchestrator, RunOutcome, RunReport,
};
pub use pipeline::{
    MatchingConfig, QualityConfig, ReconciliationOutcome, ReconciliationPipeline,
    ReconciliationReport,
};
pub use sky::SkyPosition;
pub use wcs::CoordinateTransform;
