//! Tiered retention: keep everything recent, then one archive per ISO week,
//! then one per calendar month, then nothing. Manual archives are exempt.
//!
//! Planning is pure. It classifies; deleting is a separate caller action.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::{ArchiveKind, ArchiveManifest};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error(
        "retention windows must grow: daily {daily} <= weekly {weekly} <= monthly {monthly} days"
    )]
    WindowOrder { daily: u32, weekly: u32, monthly: u32 },
    #[error("monthly anchor day must be 1-31, got {0}")]
    AnchorDay(u32),
}

/// Retention thresholds, all in days of age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Archives younger than this are all kept.
    pub daily_days: u32,
    /// Up to this age, one archive per ISO week is kept.
    pub weekly_until_days: u32,
    /// Up to this age, one archive per calendar month is kept.
    pub monthly_until_days: u32,
    pub weekly_anchor: Weekday,
    pub monthly_anchor_day: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 30,
            weekly_until_days: 90,
            monthly_until_days: 365,
            weekly_anchor: Weekday::Sun,
            monthly_anchor_day: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.daily_days > self.weekly_until_days || self.weekly_until_days > self.monthly_until_days
        {
            return Err(PolicyError::WindowOrder {
                daily: self.daily_days,
                weekly: self.weekly_until_days,
                monthly: self.monthly_until_days,
            });
        }
        if !(1..=31).contains(&self.monthly_anchor_day) {
            return Err(PolicyError::AnchorDay(self.monthly_anchor_day));
        }
        Ok(())
    }
}

/// The manifest fields the planner looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionCandidate {
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: ArchiveKind,
}

impl From<&ArchiveManifest> for RetentionCandidate {
    fn from(manifest: &ArchiveManifest) -> Self {
        Self {
            archive_id: manifest.archive_id.clone(),
            created_at: manifest.created_at,
            kind: manifest.kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Daily,
    Weekly,
    Monthly,
    Manual,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionReason {
    WithinActiveWindow,
    BucketRepresentative,
    SupersededByBucketMate,
    AgeWindowPruned,
    ManualProtected,
}

impl RetentionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionReason::WithinActiveWindow => "within-active-window",
            RetentionReason::BucketRepresentative => "bucket-representative",
            RetentionReason::SupersededByBucketMate => "superseded-by-bucket-mate",
            RetentionReason::AgeWindowPruned => "age-window-pruned",
            RetentionReason::ManualProtected => "manual-protected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
    pub keep: bool,
    pub bucket: Bucket,
    /// `2026-W41` for weekly buckets, `2026-10` for monthly ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_key: Option<String>,
    pub reason: RetentionReason,
}

#[derive(Debug, Clone)]
pub struct RetentionPlanner {
    policy: RetentionPolicy,
}

impl RetentionPlanner {
    pub fn new(policy: RetentionPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// One decision per candidate, in input order.
    pub fn plan(&self, candidates: &[RetentionCandidate], now: DateTime<Utc>) -> Vec<RetentionDecision> {
        let mut decisions: Vec<RetentionDecision> = candidates
            .iter()
            .map(|c| self.classify(c, now))
            .collect();

        // Index of the current representative per (tier, bucket key).
        let mut winners: HashMap<(Bucket, String), usize> = HashMap::new();
        for (idx, decision) in decisions.iter().enumerate() {
            let Some(key) = &decision.bucket_key else {
                continue;
            };
            winners
                .entry((decision.bucket, key.clone()))
                .and_modify(|best| {
                    let bucket = decision.bucket;
                    if self.rank(bucket, &candidates[idx]) < self.rank(bucket, &candidates[*best]) {
                        *best = idx;
                    }
                })
                .or_insert(idx);
        }
        for (idx, decision) in decisions.iter_mut().enumerate() {
            let Some(key) = &decision.bucket_key else {
                continue;
            };
            let won = winners.get(&(decision.bucket, key.clone())) == Some(&idx);
            decision.keep = won;
            decision.reason = if won {
                RetentionReason::BucketRepresentative
            } else {
                RetentionReason::SupersededByBucketMate
            };
        }
        decisions
    }

    fn classify(&self, candidate: &RetentionCandidate, now: DateTime<Utc>) -> RetentionDecision {
        let age_days = (now - candidate.created_at).num_days().max(0);
        let at = candidate.created_at;
        let (bucket, bucket_key, keep, reason) = if candidate.kind == ArchiveKind::Manual {
            (Bucket::Manual, None, true, RetentionReason::ManualProtected)
        } else if age_days < i64::from(self.policy.daily_days) {
            (Bucket::Daily, None, true, RetentionReason::WithinActiveWindow)
        } else if age_days < i64::from(self.policy.weekly_until_days) {
            let week = at.iso_week();
            let key = format!("{}-W{:02}", week.year(), week.week());
            // Settled once buckets are compared.
            (Bucket::Weekly, Some(key), false, RetentionReason::SupersededByBucketMate)
        } else if age_days < i64::from(self.policy.monthly_until_days) {
            let key = format!("{}-{:02}", at.year(), at.month());
            (Bucket::Monthly, Some(key), false, RetentionReason::SupersededByBucketMate)
        } else {
            (Bucket::Expired, None, false, RetentionReason::AgeWindowPruned)
        };
        RetentionDecision {
            archive_id: candidate.archive_id.clone(),
            created_at: at,
            age_days,
            keep,
            bucket,
            bucket_key,
            reason,
        }
    }

    /// Lower ranks win a bucket: anchor-day archives first, then the
    /// earliest, then the smallest id. A bucket with no anchor-day archive
    /// therefore keeps its earliest.
    fn rank<'a>(
        &self,
        bucket: Bucket,
        candidate: &'a RetentionCandidate,
    ) -> (bool, DateTime<Utc>, &'a str) {
        let on_anchor = match bucket {
            Bucket::Weekly => candidate.created_at.weekday() == self.policy.weekly_anchor,
            Bucket::Monthly => candidate.created_at.day() == self.policy.monthly_anchor_day,
            _ => false,
        };
        (!on_anchor, candidate.created_at, candidate.archive_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).single().expect("now")
    }

    fn candidate(days_ago: i64, kind: ArchiveKind) -> RetentionCandidate {
        let created_at = now() - Duration::days(days_ago);
        RetentionCandidate {
            archive_id: format!("{}-{days_ago:08x}", created_at.format("%Y%m%dT%H%M%SZ")),
            created_at,
            kind,
        }
    }

    fn planner() -> RetentionPlanner {
        RetentionPlanner::new(RetentionPolicy::default()).expect("default policy is valid")
    }

    #[test]
    fn four_hundred_daily_archives_thin_out_by_tier() {
        let candidates: Vec<_> = (0..400).map(|d| candidate(d, ArchiveKind::Automatic)).collect();
        let decisions = planner().plan(&candidates, now());
        assert_eq!(decisions.len(), 400);

        for d in &decisions {
            match d.age_days {
                0..=29 => assert!(d.keep && d.reason == RetentionReason::WithinActiveWindow),
                365.. => assert!(!d.keep && d.reason == RetentionReason::AgeWindowPruned),
                _ => assert!(d.bucket_key.is_some()),
            }
        }

        let mut kept_per_bucket: BTreeMap<(String, String), usize> = BTreeMap::new();
        for d in decisions.iter().filter(|d| d.bucket_key.is_some()) {
            let key = (format!("{:?}", d.bucket), d.bucket_key.clone().unwrap_or_default());
            *kept_per_bucket.entry(key).or_default() += usize::from(d.keep);
        }
        assert!(kept_per_bucket.values().all(|&kept| kept == 1));

        let weekly: BTreeSet<_> = decisions
            .iter()
            .filter(|d| d.bucket == Bucket::Weekly)
            .filter_map(|d| d.bucket_key.clone())
            .collect();
        let monthly: BTreeSet<_> = decisions
            .iter()
            .filter(|d| d.bucket == Bucket::Monthly)
            .filter_map(|d| d.bucket_key.clone())
            .collect();
        let kept = decisions.iter().filter(|d| d.keep).count();
        assert_eq!(kept, 30 + weekly.len() + monthly.len());
    }

    #[test]
    fn representatives_sit_on_anchor_days_when_possible() {
        let candidates: Vec<_> = (0..400).map(|d| candidate(d, ArchiveKind::Automatic)).collect();
        let decisions = planner().plan(&candidates, now());

        for d in decisions.iter().filter(|d| d.reason == RetentionReason::BucketRepresentative) {
            let mates: Vec<_> = decisions
                .iter()
                .filter(|o| o.bucket == d.bucket && o.bucket_key == d.bucket_key)
                .collect();
            let anchor = |o: &RetentionDecision| match o.bucket {
                Bucket::Weekly => o.created_at.weekday() == Weekday::Sun,
                _ => o.created_at.day() == 1,
            };
            if mates.iter().any(|o| anchor(o)) {
                assert!(anchor(d), "{} should be on its anchor day", d.archive_id);
            } else {
                let earliest = mates.iter().map(|o| o.created_at).min();
                assert_eq!(Some(d.created_at), earliest);
            }
        }
    }

    #[test]
    fn old_manual_archive_survives_its_automatic_neighbours() {
        let candidates = vec![
            candidate(402, ArchiveKind::Automatic),
            candidate(401, ArchiveKind::Manual),
            candidate(400, ArchiveKind::Automatic),
        ];
        let decisions = planner().plan(&candidates, now());

        assert!(!decisions[0].keep);
        assert!(decisions[1].keep);
        assert_eq!(decisions[1].reason, RetentionReason::ManualProtected);
        assert_eq!(decisions[1].bucket, Bucket::Manual);
        assert!(!decisions[2].keep);
        assert_eq!(decisions[2].reason, RetentionReason::AgeWindowPruned);
    }

    #[test]
    fn same_day_tie_keeps_the_earliest() {
        let morning = candidate(40, ArchiveKind::Automatic);
        let mut evening = morning.clone();
        evening.created_at += Duration::hours(6);
        evening.archive_id = "evening".into();

        let decisions = planner().plan(&[evening, morning], now());
        assert!(!decisions[0].keep);
        assert_eq!(decisions[0].reason, RetentionReason::SupersededByBucketMate);
        assert!(decisions[1].keep);
    }

    #[test]
    fn future_dated_archives_count_as_new() {
        let decisions = planner().plan(&[candidate(-3, ArchiveKind::Automatic)], now());
        assert_eq!(decisions[0].age_days, 0);
        assert!(decisions[0].keep);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let inverted = RetentionPolicy {
            daily_days: 100,
            ..RetentionPolicy::default()
        };
        assert!(matches!(
            RetentionPlanner::new(inverted),
            Err(PolicyError::WindowOrder { .. })
        ));
        let bad_anchor = RetentionPolicy {
            monthly_anchor_day: 0,
            ..RetentionPolicy::default()
        };
        assert_eq!(
            RetentionPlanner::new(bad_anchor).err(),
            Some(PolicyError::AnchorDay(0))
        );
    }

    #[test]
    fn reasons_serialize_as_kebab_case() {
        for reason in [
            RetentionReason::WithinActiveWindow,
            RetentionReason::BucketRepresentative,
            RetentionReason::SupersededByBucketMate,
            RetentionReason::AgeWindowPruned,
            RetentionReason::ManualProtected,
        ] {
            let json = serde_json::to_value(reason).expect("json");
            assert_eq!(json, reason.as_str());
        }
    }

    proptest! {
        #[test]
        fn planning_is_idempotent_and_keeps_manual(
            ages in proptest::collection::vec((0i64..500, any::<bool>()), 0..60)
        ) {
            let candidates: Vec<_> = ages
                .iter()
                .enumerate()
                .map(|(i, (age, manual))| {
                    let kind = if *manual { ArchiveKind::Manual } else { ArchiveKind::Automatic };
                    let mut c = candidate(*age, kind);
                    c.archive_id = format!("{}-{i}", c.archive_id);
                    c
                })
                .collect();
            let planner = planner();
            let first = planner.plan(&candidates, now());
            prop_assert_eq!(&first, &planner.plan(&candidates, now()));
            for (c, d) in candidates.iter().zip(&first) {
                prop_assert_eq!(&c.archive_id, &d.archive_id);
                if c.kind == ArchiveKind::Manual {
                    prop_assert!(d.keep);
                }
            }
        }
    }
}
