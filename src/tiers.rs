//! Routing of caller model names onto the configured backend tiers.
//!
//! Callers ask for Claude model ids (`claude-3-5-haiku-20241022`, `claude-opus-4-1`, ...).
//! The gateway only knows three backend models, one per [`Tier`], and picks one by looking
//! for a size hint inside the requested id.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{TierConfig, TiersConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Middle,
    Large,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Middle => "middle",
            Tier::Large => "large",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size hints matched case-insensitively against the requested model id.
/// When several hints match, the longest one wins.
const SIZE_HINTS: &[(&str, Tier)] = &[
    ("haiku", Tier::Small),
    ("sonnet", Tier::Middle),
    ("opus", Tier::Large),
];

/// The outcome of routing one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedModel {
    pub tier: Tier,
    pub model: String,
    /// Tier defaults to merge under the translated request's own fields.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    small: TierConfig,
    middle: TierConfig,
    large: TierConfig,
}

impl ModelRouter {
    pub fn new(tiers: &TiersConfig) -> Self {
        Self {
            small: tiers.small.clone(),
            middle: tiers.middle.clone(),
            large: tiers.large.clone(),
        }
    }

    /// Pick the tier for a requested model id. Never fails: unknown ids go to `Middle`.
    #[must_use]
    pub fn tier_for(&self, requested: &str) -> Tier {
        let lowered = requested.to_lowercase();
        SIZE_HINTS
            .iter()
            .filter(|(hint, _)| lowered.contains(hint))
            .max_by_key(|(hint, _)| hint.len())
            .map_or(Tier::Middle, |(_, tier)| *tier)
    }

    #[must_use]
    pub fn route(&self, requested: &str) -> RoutedModel {
        let tier = self.tier_for(requested);
        let target = self.target(tier);
        tracing::debug!(requested, %tier, backend_model = %target.model, "Routed model");
        RoutedModel {
            tier,
            model: target.model.clone(),
            extra: target.extra.clone(),
        }
    }

    pub fn target(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Small => &self.small,
            Tier::Middle => &self.middle,
            Tier::Large => &self.large,
        }
    }

    /// All tiers with their backend model, smallest first.
    pub fn targets(&self) -> [(Tier, &TierConfig); 3] {
        [
            (Tier::Small, &self.small),
            (Tier::Middle, &self.middle),
            (Tier::Large, &self.large),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> ModelRouter {
        let mut large_extra = Map::new();
        large_extra.insert("reasoning_effort".to_string(), json!("high"));
        ModelRouter::new(&TiersConfig {
            small: TierConfig {
                model: "gpt-4o-mini".to_string(),
                extra: Map::new(),
            },
            middle: TierConfig {
                model: "gpt-4o".to_string(),
                extra: Map::new(),
            },
            large: TierConfig {
                model: "o3".to_string(),
                extra: large_extra,
            },
        })
    }

    #[test]
    fn test_size_hints() {
        let r = router();
        assert_eq!(r.tier_for("claude-3-5-haiku-20241022"), Tier::Small);
        assert_eq!(r.tier_for("claude-sonnet-4-20250514"), Tier::Middle);
        assert_eq!(r.tier_for("claude-opus-4-1"), Tier::Large);
        assert_eq!(r.tier_for("CLAUDE-3-HAIKU"), Tier::Small);
    }

    #[test]
    fn test_unknown_model_defaults_to_middle() {
        let r = router();
        assert_eq!(r.tier_for("gpt-4o"), Tier::Middle);
        assert_eq!(r.tier_for(""), Tier::Middle);
    }

    #[test]
    fn test_longest_hint_wins() {
        // "sonnet" (6) beats "opus" (4) when both appear.
        let r = router();
        assert_eq!(r.tier_for("opus-distilled-sonnet"), Tier::Middle);
    }

    #[test]
    fn test_route_carries_tier_extras() {
        let routed = router().route("claude-opus-4");
        assert_eq!(routed.tier, Tier::Large);
        assert_eq!(routed.model, "o3");
        assert_eq!(routed.extra["reasoning_effort"], "high");
    }
}
