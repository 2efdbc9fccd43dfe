//! Data sources computed from an in-memory dump of raw activity records

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use statsnap_common::utils::{days_inclusive, round_to};
use statsnap_common::{Result, StatsError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::period::Period;
use crate::ports::{
    ActiveUser, ActivitySummary, LengthStats, PopularPost, PostActivitySource, RegistrationPoint,
    RetentionStats, UserActivitySource,
};

fn default_status() -> String {
    "published".to_string()
}

fn default_source() -> String {
    "web".to_string()
}

/// One post as exported by the content store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub author_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub body_length: u64,
    pub created_at: DateTime<Utc>,
}

/// One user with the timestamps of their recorded activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub activity: Vec<DateTime<Utc>>,
}

/// Raw activity export consumed by [`RecordActivitySource`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityDump {
    #[serde(default)]
    pub posts: Vec<PostRecord>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl ActivityDump {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StatsError::data_source_with_source(
                format!("Failed to read activity dump {}", path.display()),
                e,
            )
        })?;
        let dump: ActivityDump = serde_json::from_str(&content)?;
        info!(
            path = %path.display(),
            posts = dump.posts.len(),
            users = dump.users.len(),
            "Loaded activity dump"
        );
        Ok(dump)
    }
}

/// Implements both data source traits over an [`ActivityDump`]
#[derive(Debug, Clone, Default)]
pub struct RecordActivitySource {
    dump: ActivityDump,
}

impl RecordActivitySource {
    pub fn new(dump: ActivityDump) -> Self {
        Self { dump }
    }

    fn posts_in(&self, period: &Period) -> impl Iterator<Item = &PostRecord> + '_ {
        let period = *period;
        self.dump
            .posts
            .iter()
            .filter(move |post| period.contains(post.created_at))
    }

    fn active_user_ids(&self, period: &Period) -> HashSet<&str> {
        let mut active: HashSet<&str> = self
            .dump
            .users
            .iter()
            .filter(|user| user.activity.iter().any(|ts| period.contains(*ts)))
            .map(|user| user.id.as_str())
            .collect();
        active.extend(self.posts_in(period).map(|post| post.author_id.as_str()));
        active
    }

    fn count_by<F>(&self, period: &Period, field: F) -> BTreeMap<String, u64>
    where
        F: Fn(&PostRecord) -> &str,
    {
        let mut counts = BTreeMap::new();
        for post in self.posts_in(period) {
            *counts.entry(field(post).to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl PostActivitySource for RecordActivitySource {
    async fn total_posts_count(&self, period: &Period) -> Result<u64> {
        Ok(self.posts_in(period).count() as u64)
    }

    async fn post_activity_summary(&self, period: &Period) -> Result<ActivitySummary> {
        let posts: Vec<&PostRecord> = self.posts_in(period).collect();
        if posts.is_empty() {
            return Ok(ActivitySummary::default());
        }

        let total_views: u64 = posts.iter().map(|post| post.views).sum();
        let authors: HashSet<&str> = posts.iter().map(|post| post.author_id.as_str()).collect();

        let mut per_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for post in &posts {
            *per_day.entry(post.created_at.date_naive()).or_insert(0) += 1;
        }
        // BTreeMap iterates in date order, so the first maximum is the earliest day
        let busiest_day = per_day
            .iter()
            .fold(None, |best: Option<(NaiveDate, u64)>, (day, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*day, *count)),
            })
            .map(|(day, _)| day);

        Ok(ActivitySummary {
            total_posts: posts.len() as u64,
            total_views,
            unique_authors: authors.len() as u64,
            average_views: round_to(total_views as f64 / posts.len() as f64, 2),
            busiest_day,
        })
    }

    async fn posts_count_by_status(&self, period: &Period) -> Result<BTreeMap<String, u64>> {
        Ok(self.count_by(period, |post| post.status.as_str()))
    }

    async fn posts_count_by_source(&self, period: &Period) -> Result<BTreeMap<String, u64>> {
        Ok(self.count_by(period, |post| post.source.as_str()))
    }

    async fn popular_posts(&self, period: &Period, limit: usize) -> Result<Vec<PopularPost>> {
        let mut posts: Vec<&PostRecord> = self.posts_in(period).collect();
        posts.sort_by(|a, b| {
            b.views
                .cmp(&a.views)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(posts
            .into_iter()
            .take(limit)
            .map(|post| PopularPost {
                post_id: post.id.clone(),
                title: post.title.clone(),
                author_id: post.author_id.clone(),
                views: post.views,
                created_at: post.created_at,
            })
            .collect())
    }

    async fn post_length_stats(&self, period: &Period) -> Result<LengthStats> {
        let mut lengths: Vec<u64> = self.posts_in(period).map(|post| post.body_length).collect();
        if lengths.is_empty() {
            return Ok(LengthStats::default());
        }
        lengths.sort_unstable();

        let count = lengths.len();
        let median = if count % 2 == 0 {
            (lengths[count / 2 - 1] + lengths[count / 2]) as f64 / 2.0
        } else {
            lengths[count / 2] as f64
        };

        Ok(LengthStats {
            min: lengths[0],
            max: lengths[count - 1],
            average: round_to(lengths.iter().sum::<u64>() as f64 / count as f64, 2),
            median,
        })
    }

    async fn has_data_for_period(&self, period: &Period) -> Result<bool> {
        Ok(self.posts_in(period).next().is_some())
    }
}

#[async_trait]
impl UserActivitySource for RecordActivitySource {
    async fn active_users_count(&self, period: &Period) -> Result<u64> {
        Ok(self.active_user_ids(period).len() as u64)
    }

    async fn new_users_count(&self, period: &Period) -> Result<u64> {
        Ok(self
            .dump
            .users
            .iter()
            .filter(|user| period.contains(user.registered_at))
            .count() as u64)
    }

    async fn most_active_users(&self, period: &Period, limit: usize) -> Result<Vec<ActiveUser>> {
        let mut post_counts: HashMap<&str, u64> = HashMap::new();
        for post in self.posts_in(period) {
            *post_counts.entry(post.author_id.as_str()).or_insert(0) += 1;
        }

        let usernames: HashMap<&str, &str> = self
            .dump
            .users
            .iter()
            .map(|user| (user.id.as_str(), user.username.as_str()))
            .collect();

        let mut ranked: Vec<(&str, u64)> = post_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(user_id, post_count)| ActiveUser {
                user_id: user_id.to_string(),
                username: usernames.get(user_id).copied().unwrap_or(user_id).to_string(),
                post_count,
            })
            .collect())
    }

    async fn registration_trend(&self, period: &Period) -> Result<Vec<RegistrationPoint>> {
        let mut per_day: BTreeMap<NaiveDate, u64> =
            days_inclusive(period.start_date(), period.last_date())
                .into_iter()
                .map(|day| (day, 0))
                .collect();

        for user in &self.dump.users {
            if period.contains(user.registered_at) {
                *per_day.entry(user.registered_at.date_naive()).or_insert(0) += 1;
            }
        }

        Ok(per_day
            .into_iter()
            .map(|(date, count)| RegistrationPoint { date, count })
            .collect())
    }

    async fn retention_analysis(&self, period: &Period) -> Result<RetentionStats> {
        let active = self.active_user_ids(period);
        let cohort: Vec<&UserRecord> = self
            .dump
            .users
            .iter()
            .filter(|user| user.registered_at < period.start_time())
            .collect();

        let retained = cohort
            .iter()
            .filter(|user| active.contains(user.id.as_str()))
            .count() as u64;
        let cohort_size = cohort.len() as u64;
        let retention_rate = if cohort_size == 0 {
            0.0
        } else {
            round_to(retained as f64 / cohort_size as f64 * 100.0, 2)
        };

        Ok(RetentionStats {
            cohort_size,
            retained,
            retention_rate,
        })
    }

    async fn has_data_for_period(&self, period: &Period) -> Result<bool> {
        Ok(self.dump.users.iter().any(|user| {
            period.contains(user.registered_at)
                || user.activity.iter().any(|ts| period.contains(*ts))
        }))
    }
}
