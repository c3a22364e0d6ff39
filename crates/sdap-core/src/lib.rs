//! Core domain model for the startup funding pipeline: raw and clean records,
//! the history merge key, and the engine-independent text/date utilities the
//! clean-staging step is built from.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sdap-core";

/// Field name under which every raw record carries its scrape timestamp.
pub const SCRAPED_AT_FIELD: &str = "scraped_at";

/// Delimiter of the multi-valued industry field.
pub const INDUSTRY_DELIMITER: char = ',';

/// Canonical textual timestamp form (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
/// Boundary between the date and time halves of [`TIMESTAMP_FORMAT`].
pub const TIMESTAMP_SEPARATOR: char = ' ';

/// Column names of the clean tables.
pub mod columns {
    pub const COMPANY: &str = "company";
    pub const COUNTRY: &str = "country";
    pub const WEBSITE: &str = "website";
    pub const INDUSTRY_TAG: &str = "industry_tag";
    pub const FUNDING_AMOUNT: &str = "funding_amount";
    pub const FUNDING_TYPE: &str = "funding_type";
    pub const LAST_FUNDING_DATE: &str = "last_funding_date";
    pub const SCRAPED_DATE: &str = "scraped_date";
    pub const SCRAPED_TIME: &str = "scraped_time";

    /// Composite business key of the clean history table.
    pub const KEY: [&str; 4] = [COMPANY, COUNTRY, INDUSTRY_TAG, LAST_FUNDING_DATE];

    /// Columns a merge may overwrite on a matched history row.
    pub const MUTABLE: [&str; 5] = [
        WEBSITE,
        FUNDING_AMOUNT,
        FUNDING_TYPE,
        SCRAPED_DATE,
        SCRAPED_TIME,
    ];

    /// Every clean column in table order.
    pub const ALL: [&str; 9] = [
        COMPANY,
        COUNTRY,
        WEBSITE,
        INDUSTRY_TAG,
        FUNDING_AMOUNT,
        FUNDING_TYPE,
        LAST_FUNDING_DATE,
        SCRAPED_DATE,
        SCRAPED_TIME,
    ];
}

/// One scraped row with sanitized column names and the run timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    fields: BTreeMap<String, String>,
    scraped_at: DateTime<Utc>,
}

impl RawRecord {
    /// Builds a record; the timestamp is truncated to whole seconds.
    pub fn new(fields: BTreeMap<String, String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            fields,
            scraped_at: scraped_at.trunc_subsecs(0),
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn scraped_at(&self) -> DateTime<Utc> {
        self.scraped_at
    }
}

/// A cleaned, exploded, retyped record as stored in the clean tables.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleanRecord {
    pub company: Option<String>,
    pub country: Option<String>,
    pub website: Option<String>,
    pub industry_tag: Option<String>,
    pub funding_amount: Option<String>,
    pub funding_type: Option<String>,
    pub last_funding_date: Option<NaiveDate>,
    pub scraped_date: Option<NaiveDate>,
    pub scraped_time: Option<NaiveTime>,
}

impl CleanRecord {
    /// The composite history key, or `None` when any component is null.
    pub fn merge_key(&self) -> Option<MergeKey> {
        MergeKey::new(
            self.company.as_deref(),
            self.country.as_deref(),
            self.industry_tag.as_deref(),
            self.last_funding_date,
        )
    }

    /// Copies the mutable columns of `newer` onto `self`; key columns stay put.
    pub fn take_mutable_from(&mut self, newer: &CleanRecord) {
        self.website = newer.website.clone();
        self.funding_amount = newer.funding_amount.clone();
        self.funding_type = newer.funding_type.clone();
        self.scraped_date = newer.scraped_date;
        self.scraped_time = newer.scraped_time;
    }
}

/// `(company, country, industry_tag, last_funding_date)` with every component
/// present. Rows with a null component have no key and never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeKey {
    pub company: String,
    pub country: String,
    pub industry_tag: String,
    pub last_funding_date: NaiveDate,
}

impl MergeKey {
    pub fn new(
        company: Option<&str>,
        country: Option<&str>,
        industry_tag: Option<&str>,
        last_funding_date: Option<NaiveDate>,
    ) -> Option<Self> {
        Some(Self {
            company: company?.to_string(),
            country: country?.to_string(),
            industry_tag: industry_tag?.to_string(),
            last_funding_date: last_funding_date?,
        })
    }
}

/// Strips a header label down to ASCII letters, digits, `_` and whitespace.
/// Whitespace runs collapse to a single space and the ends are trimmed.
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || c.is_ascii_whitespace())
        .collect::<String>()
        .split_ascii_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trimmed, upper-cased copy of `text`. Uses Unicode case mapping, so the
/// result does not depend on the process locale.
pub fn fold_upper(text: &str) -> String {
    text.trim().to_uppercase()
}

/// Splits a multi-valued field on `delimiter`, trimming each tag and dropping
/// empty fragments.
pub fn split_tags(value: &str, delimiter: char) -> Vec<String> {
    value
        .split(delimiter)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses abbreviated-month / four-digit-year text such as `Jan 2023` into the
/// first day of that month. Anything else yields `None`.
pub fn parse_month_year(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let (month, year) = text.split_once(char::is_whitespace)?;
    let year = year.trim();
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(&format!("1 {month} {year}"), "%d %b %Y").ok()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Splits canonical timestamp text at the date/time boundary.
pub fn split_timestamp_text(text: &str) -> Option<(&str, &str)> {
    text.split_once(TIMESTAMP_SEPARATOR)
}

/// Rejoins the halves produced by [`split_timestamp_text`].
pub fn join_timestamp_text(date: &str, time: &str) -> String {
    format!("{date}{TIMESTAMP_SEPARATOR}{time}")
}

/// Date and UTC time-of-day of `ts`, derived from its canonical text form.
pub fn split_timestamp(ts: DateTime<Utc>) -> (Option<NaiveDate>, Option<NaiveTime>) {
    split_timestamp_str(&format_timestamp(ts))
}

/// Like [`split_timestamp`] but from stored text; each half that fails to
/// parse comes back as `None`.
pub fn split_timestamp_str(text: &str) -> (Option<NaiveDate>, Option<NaiveTime>) {
    match split_timestamp_text(text.trim()) {
        Some((date, time)) => (
            NaiveDate::parse_from_str(date, DATE_FORMAT).ok(),
            NaiveTime::parse_from_str(time, TIME_FORMAT).ok(),
        ),
        None => (None, None),
    }
}
