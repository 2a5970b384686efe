// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Service configuration (config server or JSON file)
// - schema:     Record wire format and the showcase read model
// - util:       Link resolution and phone normalisation
// - retry:      Bounded retry executor with a recovery step
// - metrics:    Process-wide runtime counters
// - telemetry:  Bounded, fire-and-forget telemetry points
// - transport:  Redis refresh broadcast and `providers` batch queue
// - sources:    Source adapters and adapter registry
// - collector:  Listing fetch, detail worker pool, refresh loop
// - store:      Persistence traits, Postgres and in-memory stores
// - aggregator: Validation and transactional reconciliation
// - showcase:   Read-only HTTP listing of stored providers
// - context:    Per-process handles, shutdown and signals
//
pub mod aggregator;
pub mod collector;
pub mod config;
pub mod context;
pub mod metrics;
pub mod retry;
pub mod schema;
pub mod showcase;
pub mod sources;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod util;
