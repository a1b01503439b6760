//! The seven additive daily counters shared by increments, rows and summaries.

use crate::event::Action;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::ops::{Add, AddAssign};

/// Counter field names, in column order. Also used as Redis hash fields.
pub const COUNTER_FIELDS: [&str; 7] = [
    "upload_count",
    "upload_bytes",
    "delete_count",
    "delete_bytes",
    "share_count",
    "download_count",
    "download_bytes",
];

/// Daily activity counters for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Counters {
    pub upload_count: i64,
    pub upload_bytes: i64,
    pub delete_count: i64,
    pub delete_bytes: i64,
    pub share_count: i64,
    pub download_count: i64,
    pub download_bytes: i64,
}

impl Counters {
    /// The increment a single action contributes.
    ///
    /// Exactly one count is 1; the matching byte counter carries the clamped
    /// file size. Share events carry no bytes.
    pub fn increment_for(action: Action, file_bytes: i64) -> Self {
        let bytes = file_bytes.max(0);
        match action {
            Action::Upload => Self {
                upload_count: 1,
                upload_bytes: bytes,
                ..Default::default()
            },
            Action::Delete => Self {
                delete_count: 1,
                delete_bytes: bytes,
                ..Default::default()
            },
            Action::Share => Self {
                share_count: 1,
                ..Default::default()
            },
            Action::Download => Self {
                download_count: 1,
                download_bytes: bytes,
                ..Default::default()
            },
        }
    }

    /// Field values in `COUNTER_FIELDS` order
    pub fn values(&self) -> [i64; 7] {
        [
            self.upload_count,
            self.upload_bytes,
            self.delete_count,
            self.delete_bytes,
            self.share_count,
            self.download_count,
            self.download_bytes,
        ]
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, i64)> {
        COUNTER_FIELDS.into_iter().zip(self.values())
    }

    /// Overwrite one counter by field name. Unknown names are ignored.
    pub fn set_field(&mut self, field: &str, value: i64) {
        match field {
            "upload_count" => self.upload_count = value,
            "upload_bytes" => self.upload_bytes = value,
            "delete_count" => self.delete_count = value,
            "delete_bytes" => self.delete_bytes = value,
            "share_count" => self.share_count = value,
            "download_count" => self.download_count = value,
            "download_bytes" => self.download_bytes = value,
            _ => {}
        }
    }

    pub fn is_zero(&self) -> bool {
        self.values().iter().all(|v| *v == 0)
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, rhs: Self) {
        self.upload_count += rhs.upload_count;
        self.upload_bytes += rhs.upload_bytes;
        self.delete_count += rhs.delete_count;
        self.delete_bytes += rhs.delete_bytes;
        self.share_count += rhs.share_count;
        self.download_count += rhs.download_count;
        self.download_bytes += rhs.download_bytes;
    }
}

impl Add for Counters {
    type Output = Counters;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl std::iter::Sum for Counters {
    fn sum<I: Iterator<Item = Counters>>(iter: I) -> Self {
        iter.fold(Counters::default(), Add::add)
    }
}
