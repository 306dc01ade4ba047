use crate::error::{Error, Result};
use crate::types::User;
use crate::utils::current_timestamp;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use std::fs;
use std::path::Path;

/// Account lookups the gateway needs. The backing store owns the data; the
/// gateway only reads.
pub trait UserStore: Send + Sync {
    fn find_by_token(&self, token: &str) -> Option<User>;
    /// Not expired and not banned.
    fn is_available(&self, user: &User) -> bool;
    /// Days until the next monthly traffic reset, when one applies.
    fn reset_cycle_days(&self, user: &User) -> Option<i64>;
}

/// User snapshot loaded from a YAML file at startup, indexed by token.
pub struct YamlUserStore {
    by_token: DashMap<String, User>,
}

impl YamlUserStore {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read users file: {}", e)))?;
        let users: Vec<User> = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse users file: {}", e)))?;
        Ok(Self::from_users(users))
    }

    pub fn from_users(users: Vec<User>) -> Self {
        let by_token = DashMap::new();
        for user in users {
            by_token.insert(user.token.clone(), user);
        }
        Self { by_token }
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

impl UserStore for YamlUserStore {
    fn find_by_token(&self, token: &str) -> Option<User> {
        self.by_token.get(token).map(|u| u.clone())
    }

    fn is_available(&self, user: &User) -> bool {
        if user.banned {
            return false;
        }
        match user.expired_at {
            None => true,
            Some(at) => at > current_timestamp(),
        }
    }

    fn reset_cycle_days(&self, user: &User) -> Option<i64> {
        let expired_at = user.expired_at?;
        let now = current_timestamp();
        if expired_at <= now {
            return None;
        }

        let reset_day = DateTime::<Utc>::from_timestamp(expired_at, 0)?.day() as i64;
        let today = DateTime::<Utc>::from_timestamp(now, 0)?;
        let today_day = today.day() as i64;
        let last_day = days_in_month(today.year(), today.month()) as i64;

        if reset_day >= today_day {
            Some(reset_day - today_day)
        } else {
            Some(last_day - today_day + reset_day)
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(30)
}
