use tracing::{debug, warn};

use crate::agent::{LocateOutcome, LocateRequest, Locator};
use crate::extract::{self, Extraction};
use crate::state::{Coordinates, Screenshot};

/// Which path produced a resolved pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionSource {
    /// No screenshot or no step; no call was made.
    NothingToLocate,
    Structured,
    /// Pulled out of raw response text or error text.
    Recovered,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub coordinates: Coordinates,
    pub source: ResolutionSource,
}

impl Resolution {
    fn new(coordinates: Coordinates, source: ResolutionSource) -> Self {
        Self { coordinates, source }
    }

    fn fallback() -> Self {
        Self::new(Coordinates::FALLBACK, ResolutionSource::Fallback)
    }

    fn from_text(text: &str) -> Self {
        match extract::scan(text) {
            Extraction::Matched { pattern, coordinates } => {
                debug!(pattern, %coordinates, "coordinates recovered from text");
                Self::new(coordinates, ResolutionSource::Recovered)
            }
            Extraction::Unparseable { pattern } => {
                warn!(pattern, "matched coordinates did not parse, using fallback");
                Self::fallback()
            }
            Extraction::NoMatch => Self::fallback(),
        }
    }
}

/// Turns every locate outcome into a concrete pair. The locate call is made
/// at most once per resolution and never retried.
pub struct CoordinateResolver<L: Locator> {
    locator: L,
}

impl<L: Locator> CoordinateResolver<L> {
    pub fn new(locator: L) -> Self {
        Self { locator }
    }

    pub async fn resolve(&self, screenshot: &Screenshot, step: &str, description: &str) -> Coordinates {
        self.resolve_step(screenshot, step, description).await.coordinates
    }

    pub async fn resolve_step(
        &self,
        screenshot: &Screenshot,
        step: &str,
        description: &str,
    ) -> Resolution {
        if screenshot.is_empty() || step.trim().is_empty() {
            return Resolution::new(Coordinates::NONE, ResolutionSource::NothingToLocate);
        }

        let request = LocateRequest {
            step: step.to_string(),
            description: description.to_string(),
            screenshot: screenshot.clone(),
        };
        match self.locator.locate(&request).await {
            LocateOutcome::Structured { coordinates, .. } => {
                Resolution::new(coordinates, ResolutionSource::Structured)
            }
            LocateOutcome::Decoding { error, raw: Some(raw) } => {
                warn!(step, "structured decoding failed ({}), scanning raw text", error);
                Resolution::from_text(&raw)
            }
            LocateOutcome::Decoding { error, raw: None } => {
                warn!(step, "structured decoding failed ({}) with no raw text", error);
                Resolution::fallback()
            }
            LocateOutcome::CallFailed { error } => {
                warn!(step, "locate call failed: {}", error);
                Resolution::from_text(&error)
            }
        }
    }
}
