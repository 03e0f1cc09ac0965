// =============================================================================
// Telemetry Core
// =============================================================================
//
// Workflow/step event recording, bounded rate-limit call history, health
// checks, and priority alerts. Everything here is observational: no
// telemetry failure may abort a trading operation.

pub mod alerts;
pub mod events;
pub mod health;
pub mod rate_limit;
