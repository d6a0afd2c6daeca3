//! Fixed progression tables shared by every tracker instance.
//!
//! These are configuration, not data: they never change at runtime and are
//! never read from the store.

use serde::Serialize;

use crate::models::ReferralTier;

// -- Levels --

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelThreshold {
    pub level: u32,
    /// Lifetime earnings needed to reach this level.
    pub threshold: f64,
    pub title: &'static str,
    pub benefits: &'static [&'static str],
    pub color: &'static str,
    pub multiplier: f64,
}

/// Thresholds are strictly increasing and start at 0.
pub const LEVELS: &[LevelThreshold] = &[
    LevelThreshold {
        level: 1,
        threshold: 0.0,
        title: "Starter",
        benefits: &["basic_rewards"],
        color: "#9ca3af",
        multiplier: 1.0,
    },
    LevelThreshold {
        level: 2,
        threshold: 100.0,
        title: "Bronze",
        benefits: &["basic_rewards", "profile_badge"],
        color: "#cd7f32",
        multiplier: 1.1,
    },
    LevelThreshold {
        level: 3,
        threshold: 500.0,
        title: "Silver",
        benefits: &["basic_rewards", "profile_badge", "priority_support"],
        color: "#c0c0c0",
        multiplier: 1.25,
    },
    LevelThreshold {
        level: 4,
        threshold: 2_000.0,
        title: "Gold",
        benefits: &["basic_rewards", "profile_badge", "priority_support", "reduced_fees"],
        color: "#ffd700",
        multiplier: 1.5,
    },
    LevelThreshold {
        level: 5,
        threshold: 10_000.0,
        title: "Platinum",
        benefits: &[
            "basic_rewards",
            "profile_badge",
            "priority_support",
            "reduced_fees",
            "early_access",
        ],
        color: "#e5e4e2",
        multiplier: 1.75,
    },
    LevelThreshold {
        level: 6,
        threshold: 50_000.0,
        title: "Diamond",
        benefits: &[
            "basic_rewards",
            "profile_badge",
            "priority_support",
            "reduced_fees",
            "early_access",
            "creator_fund",
        ],
        color: "#b9f2ff",
        multiplier: 2.0,
    },
];

pub fn max_level() -> u32 {
    LEVELS.len() as u32
}

pub fn level_info(level: u32) -> Option<&'static LevelThreshold> {
    LEVELS.iter().find(|l| l.level == level)
}

/// Highest level whose threshold is at or below `earnings`.
pub fn level_for_earnings(earnings: f64) -> &'static LevelThreshold {
    LEVELS
        .iter()
        .rev()
        .find(|l| l.threshold <= earnings)
        .unwrap_or(&LEVELS[0])
}

// -- Referral tiers --

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierInfo {
    pub tier: ReferralTier,
    pub name: &'static str,
    pub min_referrals: u32,
    pub min_earnings: f64,
    /// Paid per activated referral.
    pub base_reward: f64,
    pub revenue_share_percent: f64,
}

pub const TIERS: &[TierInfo] = &[
    TierInfo {
        tier: ReferralTier::Bronze,
        name: "Bronze",
        min_referrals: 0,
        min_earnings: 0.0,
        base_reward: 5.0,
        revenue_share_percent: 5.0,
    },
    TierInfo {
        tier: ReferralTier::Silver,
        name: "Silver",
        min_referrals: 5,
        min_earnings: 100.0,
        base_reward: 10.0,
        revenue_share_percent: 7.5,
    },
    TierInfo {
        tier: ReferralTier::Gold,
        name: "Gold",
        min_referrals: 25,
        min_earnings: 1_000.0,
        base_reward: 20.0,
        revenue_share_percent: 10.0,
    },
    TierInfo {
        tier: ReferralTier::Platinum,
        name: "Platinum",
        min_referrals: 100,
        min_earnings: 5_000.0,
        base_reward: 50.0,
        revenue_share_percent: 15.0,
    },
];

pub fn tier_for_referrals(total_referrals: u32) -> ReferralTier {
    TIERS
        .iter()
        .rev()
        .find(|t| total_referrals >= t.min_referrals)
        .map_or(ReferralTier::Bronze, |t| t.tier)
}

pub fn tier_info(tier: ReferralTier) -> &'static TierInfo {
    match tier {
        ReferralTier::Bronze => &TIERS[0],
        ReferralTier::Silver => &TIERS[1],
        ReferralTier::Gold => &TIERS[2],
        ReferralTier::Platinum => &TIERS[3],
    }
}

pub fn next_tier(tier: ReferralTier) -> Option<&'static TierInfo> {
    TIERS.iter().find(|t| t.tier > tier)
}

// -- Challenge catalog --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    Daily,
    Weekly,
    Monthly,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeDefinition {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub challenge_type: ChallengeType,
    pub target_value: i64,
    pub points_reward: i64,
    pub difficulty: Difficulty,
}

pub const CHALLENGES: &[ChallengeDefinition] = &[
    ChallengeDefinition {
        id: "daily-engager",
        title: "Daily Engager",
        description: "Like or share 10 posts today",
        challenge_type: ChallengeType::Daily,
        target_value: 10,
        points_reward: 50,
        difficulty: Difficulty::Easy,
    },
    ChallengeDefinition {
        id: "weekly-creator",
        title: "Weekly Creator",
        description: "Publish 5 posts this week",
        challenge_type: ChallengeType::Weekly,
        target_value: 5,
        points_reward: 200,
        difficulty: Difficulty::Medium,
    },
    ChallengeDefinition {
        id: "community-voice",
        title: "Community Voice",
        description: "Leave 100 comments on other creators' posts",
        challenge_type: ChallengeType::Weekly,
        target_value: 100,
        points_reward: 300,
        difficulty: Difficulty::Medium,
    },
    ChallengeDefinition {
        id: "lifelong-learner",
        title: "Lifelong Learner",
        description: "Complete 3 courses this month",
        challenge_type: ChallengeType::Monthly,
        target_value: 3,
        points_reward: 500,
        difficulty: Difficulty::Hard,
    },
    ChallengeDefinition {
        id: "referral-champion",
        title: "Referral Champion",
        description: "Bring 10 new members to the platform this month",
        challenge_type: ChallengeType::Monthly,
        target_value: 10,
        points_reward: 1_000,
        difficulty: Difficulty::Hard,
    },
    ChallengeDefinition {
        id: "first-sale",
        title: "First Sale",
        description: "Sell your first item on the marketplace",
        challenge_type: ChallengeType::Special,
        target_value: 1,
        points_reward: 150,
        difficulty: Difficulty::Easy,
    },
];

pub fn challenge(id: &str) -> Option<&'static ChallengeDefinition> {
    CHALLENGES.iter().find(|c| c.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds_strictly_increasing() {
        assert_eq!(LEVELS[0].threshold, 0.0);
        for pair in LEVELS.windows(2) {
            assert!(pair[0].threshold < pair[1].threshold);
            assert_eq!(pair[0].level + 1, pair[1].level);
        }
        assert_eq!(max_level(), 6);
    }

    #[test]
    fn test_level_lookup() {
        assert_eq!(level_for_earnings(0.0).title, "Starter");
        assert_eq!(level_for_earnings(99.99).level, 1);
        assert_eq!(level_for_earnings(100.0).level, 2);
        assert_eq!(level_for_earnings(50_000.0).title, "Diamond");
        assert_eq!(level_for_earnings(-5.0).level, 1);
    }

    #[test]
    fn test_level_lookup_is_monotonic() {
        let mut prev = 0;
        let mut e = 0.0;
        while e < 60_000.0 {
            let level = level_for_earnings(e).level;
            assert!(level >= prev, "level dropped at earnings {}", e);
            prev = level;
            e += 37.5;
        }
    }

    #[test]
    fn test_tier_boundaries() {
        assert_eq!(tier_for_referrals(0), ReferralTier::Bronze);
        assert_eq!(tier_for_referrals(4), ReferralTier::Bronze);
        assert_eq!(tier_for_referrals(5), ReferralTier::Silver);
        assert_eq!(tier_for_referrals(24), ReferralTier::Silver);
        assert_eq!(tier_for_referrals(25), ReferralTier::Gold);
        assert_eq!(tier_for_referrals(99), ReferralTier::Gold);
        assert_eq!(tier_for_referrals(100), ReferralTier::Platinum);
    }

    #[test]
    fn test_next_tier() {
        assert_eq!(next_tier(ReferralTier::Bronze).map(|t| t.tier), Some(ReferralTier::Silver));
        assert!(next_tier(ReferralTier::Platinum).is_none());
    }

    #[test]
    fn test_catalog_ids_unique() {
        for (i, c) in CHALLENGES.iter().enumerate() {
            assert!(CHALLENGES[i + 1..].iter().all(|o| o.id != c.id), "duplicate {}", c.id);
            assert!(c.target_value > 0);
        }
        assert!(challenge("community-voice").is_some());
        assert!(challenge("nope").is_none());
    }
}
