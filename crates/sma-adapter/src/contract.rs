use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::types::{MeasurementAdapter, ObservationWindow};

/// Shared adapter contract suite, run against every adapter implementation.
pub fn run_adapter_contract_suite(adapter: &dyn MeasurementAdapter, window: &ObservationWindow) -> Result<()> {
    if adapter.id().trim().is_empty() {
        return Err(anyhow!("adapter id must not be empty"));
    }

    adapter.connect()?;
    adapter.start()?;
    adapter.stop()?;

    let measurements = adapter.collect(window, Duration::from_secs(10))?;
    let mut seen = HashSet::new();
    for m in &measurements {
        if m.name.trim().is_empty() {
            return Err(anyhow!("adapter {} produced a measurement without a name", adapter.id()));
        }
        if !seen.insert(m.name.as_str()) {
            return Err(anyhow!("adapter {} produced measurement {} twice", adapter.id(), m.name));
        }
        if m.samples.iter().any(|s| !s.value.is_finite()) {
            return Err(anyhow!("measurement {} contains a non-finite value", m.name));
        }
    }

    // a second collect over the same window must be allowed (retry path)
    adapter.collect(window, Duration::from_secs(10))?;

    adapter.disconnect()?;
    Ok(())
}
