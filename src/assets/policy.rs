//! Policy-driven decisions for discovered asset references. Spec §4.4
//! "Decide".

use crate::config::AssetPolicyConfig;
use crate::types::{ActionMode, AssetRef, AssetType};

pub struct Decision {
    pub asset_ref: AssetRef,
    pub mode: ActionMode,
}

fn looks_inlineable(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.ends_with(".svg") || lower.contains("icon") || lower.contains("logo")
}

/// Apply `policy` to `refs`, dropping blocked/non-allowed types and
/// stopping once `max_per_page` decisions have been made.
pub fn decide(policy: &AssetPolicyConfig, refs: Vec<AssetRef>) -> Vec<Decision> {
    if !policy.enabled {
        return Vec::new();
    }
    let mut decisions = Vec::new();
    for asset_ref in refs {
        if decisions.len() >= policy.max_per_page {
            break;
        }
        if policy.block_types.contains(&asset_ref.asset_type) {
            continue;
        }
        if !policy.allow_types.is_empty() && !policy.allow_types.contains(&asset_ref.asset_type) {
            continue;
        }
        let mode = if policy.inline_max_bytes > 0 && looks_inlineable(&asset_ref.url) {
            ActionMode::Inline
        } else {
            ActionMode::Download
        };
        decisions.push(Decision { asset_ref, mode });
    }
    decisions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AssetPolicyConfig {
        AssetPolicyConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn make_ref(url: &str, t: AssetType) -> AssetRef {
        AssetRef {
            url: url.to_string(),
            asset_type: t,
            source_attr: "src",
            original_value: url.to_string(),
        }
    }

    #[test]
    fn disabled_policy_yields_nothing() {
        let p = AssetPolicyConfig::default();
        let refs = vec![make_ref("https://x/a.png", AssetType::Img)];
        assert!(decide(&p, refs).is_empty());
    }

    #[test]
    fn blocked_type_is_dropped() {
        let mut p = policy();
        p.block_types = vec![AssetType::Script];
        let refs = vec![make_ref("https://x/a.js", AssetType::Script)];
        assert!(decide(&p, refs).is_empty());
    }

    #[test]
    fn svg_is_inlined() {
        let p = policy();
        let refs = vec![make_ref("https://x/logo.svg", AssetType::Img)];
        let decisions = decide(&p, refs);
        assert_eq!(decisions[0].mode, ActionMode::Inline);
    }

    #[test]
    fn respects_max_per_page() {
        let mut p = policy();
        p.max_per_page = 1;
        let refs = vec![
            make_ref("https://x/a.png", AssetType::Img),
            make_ref("https://x/b.png", AssetType::Img),
        ];
        assert_eq!(decide(&p, refs).len(), 1);
    }
}
