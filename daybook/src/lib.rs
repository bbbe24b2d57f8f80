//! Daybook reader library.
//! Normalizes study books and daily-reflection files into addressable entries, resolves
//! navigation intents against them, and keeps notes, progress and every dependent view in sync.
//! Everything here is synchronous except fetching the source document.

pub mod core {
    use chrono::{Datelike, NaiveDate};
    use serde::{Deserialize, Serialize};
    use serde_with::{DeserializeFromStr, SerializeDisplay};
    use std::{fmt, iter, str::FromStr};

    /* ------------------------------- IDs ------------------------------- */

    /// Identifier of a content source. Persisted state is namespaced by it.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub String);

    impl fmt::Display for DocumentId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for DocumentId {
        fn from(value: &str) -> Self {
            Self(value.to_string())
        }
    }

    /// Stable entry identifier, unique within one loaded document.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryKey(pub String);

    impl EntryKey {
        /// Key of the section at zero-based `position`.
        pub fn sequential(position: usize) -> Self {
            Self(position.to_string())
        }

        /// Key of a calendar entry: `"{month_index}-{day}"`, never zero padded.
        pub fn calendar(date: MonthDay) -> Self {
            Self(format!("{}-{}", date.month_index, date.day))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// Decodes a calendar key. `None` unless the key names a real day of the year.
        pub fn month_day(&self) -> Option<MonthDay> {
            let (month, day) = self.0.trim().split_once('-')?;
            MonthDay::new(month.parse().ok()?, day.parse().ok()?).ok()
        }
    }

    impl fmt::Display for EntryKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for EntryKey {
        fn from(value: &str) -> Self {
            Self(value.to_string())
        }
    }

    /* ------------------------- Calendar coordinates ------------------------- */

    /// Day caps per month. Feb 29 is a valid coordinate so leap-day readings resolve.
    pub const DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    pub const MONTH_NAMES: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];

    /// A year-independent `(month 0..=11, day 1..=cap)` coordinate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct MonthDay {
        month_index: u32,
        day: u32,
    }

    impl MonthDay {
        pub fn new(month_index: u32, day: u32) -> Result<Self, DomainError> {
            let cap = DAYS_IN_MONTH
                .get(month_index as usize)
                .copied()
                .ok_or(DomainError::InvalidMonth(month_index))?;
            if day == 0 || day > cap {
                return Err(DomainError::InvalidDay { month_index, day });
            }
            Ok(Self { month_index, day })
        }

        pub fn from_date(date: NaiveDate) -> Self {
            Self {
                month_index: date.month0(),
                day: date.day(),
            }
        }

        pub fn month_index(self) -> u32 {
            self.month_index
        }

        pub fn day(self) -> u32 {
            self.day
        }

        pub fn month_name(self) -> &'static str {
            MONTH_NAMES[self.month_index as usize]
        }

        /// Next day, wrapping month ends and Dec 31 -> Jan 1.
        pub fn succ(self) -> Self {
            if self.day < DAYS_IN_MONTH[self.month_index as usize] {
                Self {
                    day: self.day + 1,
                    ..self
                }
            } else {
                Self {
                    month_index: (self.month_index + 1) % 12,
                    day: 1,
                }
            }
        }

        /// Previous day, wrapping month starts and Jan 1 -> Dec 31.
        pub fn pred(self) -> Self {
            if self.day > 1 {
                Self {
                    day: self.day - 1,
                    ..self
                }
            } else {
                let month_index = (self.month_index + 11) % 12;
                Self {
                    month_index,
                    day: DAYS_IN_MONTH[month_index as usize],
                }
            }
        }

        pub fn step(self, direction: Direction) -> Self {
            match direction {
                Direction::Forward => self.succ(),
                Direction::Backward => self.pred(),
            }
        }

        /// Human label, e.g. `March 4`.
        pub fn label(self) -> String {
            format!("{} {}", self.month_name(), self.day)
        }
    }

    /// Resolves a month name case-insensitively. Three-letter abbreviations are accepted.
    pub fn month_from_name(name: &str) -> Option<u32> {
        let lower = name.trim().to_lowercase();
        if lower.chars().count() < 3 {
            return None;
        }
        MONTH_NAMES
            .iter()
            .position(|month| {
                let month = month.to_lowercase();
                month == lower || (lower.len() == 3 && month.starts_with(&lower))
            })
            .map(|idx| idx as u32)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Direction {
        Forward,
        Backward,
    }

    impl Direction {
        /// `+1` / `-1` in document terms.
        pub fn offset(self) -> i32 {
            match self {
                Direction::Forward => 1,
                Direction::Backward => -1,
            }
        }
    }

    /* ------------------------------ Groups ------------------------------ */

    /// Derived classification used for filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
    pub enum Group {
        Front,
        Steps,
        Traditions,
        /// Zero-based month of a daily reading.
        Month(u32),
    }

    impl Group {
        pub fn label(self) -> &'static str {
            match self {
                Group::Front => "Front Matter",
                Group::Steps => "Steps",
                Group::Traditions => "Traditions",
                Group::Month(idx) => MONTH_NAMES.get(idx as usize).copied().unwrap_or("Month"),
            }
        }
    }

    impl fmt::Display for Group {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Group::Front => f.write_str("front"),
                Group::Steps => f.write_str("steps"),
                Group::Traditions => f.write_str("traditions"),
                Group::Month(_) => f.write_str(&self.label().to_lowercase()),
            }
        }
    }

    impl FromStr for Group {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_lowercase().as_str() {
                "front" | "front matter" | "front-matter" => Ok(Group::Front),
                "steps" => Ok(Group::Steps),
                "traditions" => Ok(Group::Traditions),
                other => month_from_name(other)
                    .map(Group::Month)
                    .ok_or_else(|| DomainError::UnknownCategory(s.to_string())),
            }
        }
    }

    /// Active category filter.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr,
    )]
    pub enum Filter {
        #[default]
        All,
        Group(Group),
    }

    impl Filter {
        pub fn admits(self, group: Group) -> bool {
            match self {
                Filter::All => true,
                Filter::Group(wanted) => wanted == group,
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                Filter::All => "All",
                Filter::Group(group) => group.label(),
            }
        }

        /// Filter chips offered for a document layout, `All` first.
        pub fn choices(layout: Layout) -> Vec<Filter> {
            let mut out = vec![Filter::All];
            match layout {
                Layout::Sections => out.extend(
                    [Group::Front, Group::Steps, Group::Traditions].map(Filter::Group),
                ),
                Layout::Calendar => out.extend((0..12).map(|idx| Filter::Group(Group::Month(idx)))),
            }
            out
        }
    }

    impl fmt::Display for Filter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Filter::All => f.write_str("all"),
                Filter::Group(group) => fmt::Display::fmt(group, f),
            }
        }
    }

    impl FromStr for Filter {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            if s.trim().eq_ignore_ascii_case("all") {
                Ok(Filter::All)
            } else {
                s.parse().map(Filter::Group)
            }
        }
    }

    /* ------------------------------ Entries ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum EntryKind {
        Heading,
        Paragraph,
        List,
        DayReflection,
    }

    /// Content of one calendar-day reading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DayReflection {
        pub date: MonthDay,
        pub title: String,
        pub quote: String,
        pub body: String,
        pub source: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "kebab-case")]
    pub enum EntryBody {
        Heading { text: String, level: u8 },
        Paragraph { text: String },
        List { text: String, items: Vec<String> },
        DayReflection(DayReflection),
    }

    /// One addressable unit of content.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        pub key: EntryKey,
        /// Strictly increasing in document order; never reassigned after load.
        pub ordinal: usize,
        pub group: Group,
        /// Nearest heading at or before this entry (self before the first heading).
        pub anchor_key: EntryKey,
        pub page_number: Option<u32>,
        #[serde(flatten)]
        pub body: EntryBody,
    }

    impl Entry {
        pub fn kind(&self) -> EntryKind {
            match self.body {
                EntryBody::Heading { .. } => EntryKind::Heading,
                EntryBody::Paragraph { .. } => EntryKind::Paragraph,
                EntryBody::List { .. } => EntryKind::List,
                EntryBody::DayReflection(_) => EntryKind::DayReflection,
            }
        }

        pub fn is_heading(&self) -> bool {
            matches!(self.body, EntryBody::Heading { .. })
        }

        /// Text used wherever the entry is listed (outline, notes list, results).
        pub fn title(&self) -> &str {
            match &self.body {
                EntryBody::Heading { text, .. }
                | EntryBody::Paragraph { text }
                | EntryBody::List { text, .. } => text,
                EntryBody::DayReflection(day) => &day.title,
            }
        }

        pub fn month_day(&self) -> Option<MonthDay> {
            match &self.body {
                EntryBody::DayReflection(day) => Some(day.date),
                _ => None,
            }
        }

        /// Searchable text fields in display order.
        pub fn text_fields(&self) -> Vec<&str> {
            match &self.body {
                EntryBody::Heading { text, .. } | EntryBody::Paragraph { text } => vec![text.as_str()],
                EntryBody::List { text, items } => iter::once(text.as_str())
                    .chain(items.iter().map(String::as_str))
                    .collect(),
                EntryBody::DayReflection(day) => {
                    vec![day.title.as_str(), day.quote.as_str(), day.body.as_str()]
                }
            }
        }
    }

    /* ------------------------------ Documents ------------------------------ */

    /// Section documents are addressed by position, calendar documents by `(month, day)`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Layout {
        #[default]
        Sections,
        Calendar,
    }

    impl Layout {
        /// Plural noun for counts in labels.
        pub fn noun(self) -> &'static str {
            match self {
                Layout::Sections => "sections",
                Layout::Calendar => "readings",
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DocumentMetadata {
        pub title: Option<String>,
        pub author: Option<String>,
        pub subject: Option<String>,
        pub page_count: Option<u32>,
        pub creation_date: Option<String>,
    }

    /// Everything about a document except its entries.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DocumentInfo {
        pub id: DocumentId,
        pub label: String,
        pub layout: Layout,
        #[serde(default)]
        pub metadata: DocumentMetadata,
    }

    /// A normalized document: ordered entries with stable keys.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Document {
        pub info: DocumentInfo,
        pub entries: Vec<Entry>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("month index {0} is out of bounds (0..=11)")]
        InvalidMonth(u32),
        #[error("day {day} does not exist in month index {month_index}")]
        InvalidDay { month_index: u32, day: u32 },
        #[error("unknown category {0:?}")]
        UnknownCategory(String),
    }

}

pub mod raw {
    //! Tolerant serde model of a static data file.
    //!
    //! Two shapes are accepted:
    //! - section documents: `{ "metadata": {...}, "sections": [{ "type", "text", "items", "level", "pageNumber" }] }`
    //! - calendar documents: `[{ "month", "day", "title", "source", "quote", "reflection", "page_index" }]`
    //!
    //! A malformed field falls back to its default and a malformed record degrades to an
    //! empty one, so one bad record never sinks the whole document.

    use serde::Deserialize;
    use serde_with::{DefaultOnError, DisplayFromStr, PickFirst, serde_as};

    #[derive(Debug, Clone, Deserialize)]
    #[serde(untagged)]
    pub enum RawDocument {
        Days(RawDayList),
        Sections(RawSectionDocument),
    }

    impl RawDocument {
        pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
            serde_json::from_str(text)
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(transparent)]
    pub struct RawDayList {
        /// `None` marks a record that was not an object at all.
        #[serde_as(as = "Vec<DefaultOnError>")]
        pub records: Vec<Option<RawDayRecord>>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct RawSectionDocument {
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub metadata: RawMetadata,
        #[serde_as(as = "Vec<DefaultOnError>")]
        pub sections: Vec<RawSectionRecord>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RawMetadata {
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub title: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub author: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub subject: Option<String>,
        #[serde_as(as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
        #[serde(default)]
        pub page_count: Option<u32>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub creation_date: Option<String>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RawSectionRecord {
        #[serde_as(as = "DefaultOnError")]
        #[serde(default, rename = "type")]
        pub kind: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub text: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub items: Option<Vec<String>>,
        #[serde_as(as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
        #[serde(default)]
        pub level: Option<u8>,
        #[serde_as(as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
        #[serde(default)]
        pub page_number: Option<u32>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct RawDayRecord {
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub month: Option<String>,
        #[serde_as(as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
        #[serde(default)]
        pub day: Option<u32>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub title: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub source: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub quote: Option<String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub reflection: Option<String>,
        #[serde_as(as = "DefaultOnError<Option<PickFirst<(_, DisplayFromStr)>>>")]
        #[serde(default)]
        pub page_index: Option<u32>,
    }

}

pub mod normalize {
    //! Document Normalizer: raw records -> ordered, addressable entries.
    //!
    //! Section documents are a fold over the records with an explicit carry
    //! (`SectionCarry`): the group switches on qualifying headings and carries forward,
    //! and the anchor follows the most recent heading.

    use crate::core::*;
    use crate::raw::{RawDayRecord, RawDocument, RawMetadata, RawSectionRecord};
    use std::collections::HashSet;
    use tracing::{debug, warn};

    pub const DEFAULT_HEADING_LEVEL: u8 = 2;

    /// Mis-encoded punctuation and typographic characters, applied in order.
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("\u{0192}?o", "\""),
        ("\u{0192}??", "\""),
        ("\u{0192}?", "-"),
        ("\u{2013}", "-"),
        ("\u{2014}", "-"),
        ("\u{00a0}", " "),
        ("\u{2018}", "'"),
        ("\u{2019}", "'"),
        ("\u{201c}", "\""),
        ("\u{201d}", "\""),
    ];

    /// Collapses mis-encoded punctuation to plain ASCII. Applied to every stored text field.
    pub fn normalize_text(text: &str) -> String {
        REPLACEMENTS
            .iter()
            .fold(text.to_string(), |acc, (from, to)| {
                if acc.contains(from) {
                    acc.replace(from, to)
                } else {
                    acc
                }
            })
    }

    /// Running state threaded across a section document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SectionCarry {
        pub group: Group,
        pub anchor: Option<EntryKey>,
    }

    impl Default for SectionCarry {
        fn default() -> Self {
            Self {
                group: Group::Front,
                anchor: None,
            }
        }
    }

    /// Group in effect after a heading with the given (normalized) text.
    pub fn next_group(prior: Group, heading_text: &str) -> Group {
        let lower = heading_text.trim().to_lowercase();
        if lower.contains("twelve steps") {
            Group::Steps
        } else if lower.contains("twelve traditions") || lower.starts_with("tradition") {
            Group::Traditions
        } else if lower.starts_with("step") {
            Group::Steps
        } else {
            prior
        }
    }

    /// One step of the section fold: `(carry, record) -> (entry, next carry)`.
    /// The triggering heading itself takes the group and anchor it establishes.
    pub fn fold_section(
        carry: SectionCarry,
        position: usize,
        record: &RawSectionRecord,
    ) -> (Entry, SectionCarry) {
        let key = EntryKey::sequential(position);
        let text = normalize_text(record.text.as_deref().unwrap_or_default());
        let mut next = carry;

        let body = match record.kind.as_deref().map(str::trim).unwrap_or("paragraph") {
            "heading" => {
                next.group = next_group(next.group, &text);
                next.anchor = Some(key.clone());
                EntryBody::Heading {
                    text,
                    level: record.level.unwrap_or(DEFAULT_HEADING_LEVEL),
                }
            }
            "list" => EntryBody::List {
                text,
                items: record
                    .items
                    .iter()
                    .flatten()
                    .map(|item| normalize_text(item))
                    .collect(),
            },
            "paragraph" => EntryBody::Paragraph { text },
            other => {
                debug!(position, kind = other, "unknown section type; treating as paragraph");
                EntryBody::Paragraph { text }
            }
        };

        let entry = Entry {
            anchor_key: next.anchor.clone().unwrap_or_else(|| key.clone()),
            key,
            ordinal: position,
            group: next.group,
            page_number: record.page_number,
            body,
        };
        (entry, next)
    }

    pub fn normalize_sections(records: &[RawSectionRecord]) -> Vec<Entry> {
        records
            .iter()
            .enumerate()
            .scan(SectionCarry::default(), |carry, (position, record)| {
                let (entry, next) = fold_section(std::mem::take(carry), position, record);
                *carry = next;
                Some(entry)
            })
            .collect()
    }

    /// Calendar records whose month or day does not resolve are dropped, as are
    /// repeats of an already-seen day (first one wins).
    pub fn normalize_days(records: &[Option<RawDayRecord>]) -> Vec<Entry> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            let Some(record) = record else {
                warn!(position, "dropping malformed day record");
                continue;
            };
            let Some(date) = resolve_day(record) else {
                warn!(
                    position,
                    month = ?record.month,
                    day = ?record.day,
                    "dropping day record with an unresolvable date"
                );
                continue;
            };
            let key = EntryKey::calendar(date);
            if !seen.insert(key.clone()) {
                warn!(%key, position, "duplicate day record; keeping the first");
                continue;
            }

            let title = record
                .title
                .as_deref()
                .map(normalize_text)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| date.label());
            entries.push(Entry {
                anchor_key: key.clone(),
                key,
                ordinal: entries.len(),
                group: Group::Month(date.month_index()),
                page_number: record.page_index,
                body: EntryBody::DayReflection(DayReflection {
                    date,
                    title,
                    quote: normalize_text(record.quote.as_deref().unwrap_or_default()),
                    body: normalize_text(record.reflection.as_deref().unwrap_or_default()),
                    source: record
                        .source
                        .as_deref()
                        .map(normalize_text)
                        .filter(|s| !s.trim().is_empty()),
                }),
            });
        }
        entries
    }

    fn resolve_day(record: &RawDayRecord) -> Option<MonthDay> {
        let month = month_from_name(record.month.as_deref()?)?;
        MonthDay::new(month, record.day?).ok()
    }

    fn normalize_metadata(raw: RawMetadata) -> DocumentMetadata {
        let clean = |value: Option<String>| {
            value
                .map(|v| normalize_text(&v))
                .filter(|v| !v.trim().is_empty())
        };
        DocumentMetadata {
            title: clean(raw.title),
            author: clean(raw.author),
            subject: clean(raw.subject),
            page_count: raw.page_count,
            creation_date: clean(raw.creation_date),
        }
    }

    pub fn normalize_document(id: DocumentId, label: impl Into<String>, raw: RawDocument) -> Document {
        let label = label.into();
        match raw {
            RawDocument::Sections(doc) => Document {
                entries: normalize_sections(&doc.sections),
                info: DocumentInfo {
                    id,
                    label,
                    layout: Layout::Sections,
                    metadata: normalize_metadata(doc.metadata),
                },
            },
            RawDocument::Days(days) => Document {
                entries: normalize_days(&days.records),
                info: DocumentInfo {
                    id,
                    label,
                    layout: Layout::Calendar,
                    metadata: DocumentMetadata::default(),
                },
            },
        }
    }

}

pub mod index {
    //! Entry Index: built once per loaded document, never mutated afterwards.

    use crate::core::*;
    use indexmap::IndexMap;
    use tracing::warn;

    #[derive(Debug, Clone, Default)]
    pub struct EntryIndex {
        layout: Layout,
        by_key: IndexMap<EntryKey, Entry>,
    }

    impl EntryIndex {
        /// One pass over the normalized sequence. A repeated key keeps its first entry.
        pub fn build(layout: Layout, entries: impl IntoIterator<Item = Entry>) -> Self {
            let mut by_key = IndexMap::new();
            for entry in entries {
                if by_key.contains_key(&entry.key) {
                    warn!(key = %entry.key, "duplicate entry key ignored");
                    continue;
                }
                by_key.insert(entry.key.clone(), entry);
            }
            Self { layout, by_key }
        }

        pub fn empty(layout: Layout) -> Self {
            Self {
                layout,
                by_key: IndexMap::new(),
            }
        }

        pub fn layout(&self) -> Layout {
            self.layout
        }

        pub fn get(&self, key: &EntryKey) -> Option<&Entry> {
            self.by_key.get(key)
        }

        /// Coordinate lookup, keyed with the same rule used at build time.
        pub fn get_month_day(&self, date: MonthDay) -> Option<&Entry> {
            self.get(&EntryKey::calendar(date))
        }

        /// Entry with the smallest ordinal.
        pub fn first(&self) -> Option<&Entry> {
            self.by_key.values().min_by_key(|e| e.ordinal)
        }

        /// Entries in document order.
        pub fn all(&self) -> impl Iterator<Item = &Entry> + '_ {
            self.by_key.values()
        }

        pub fn at(&self, position: usize) -> Option<&Entry> {
            self.by_key.get_index(position).map(|(_, entry)| entry)
        }

        pub fn position(&self, key: &EntryKey) -> Option<usize> {
            self.by_key.get_index_of(key)
        }

        pub fn len(&self) -> usize {
            self.by_key.len()
        }

        pub fn is_empty(&self) -> bool {
            self.by_key.is_empty()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn paragraph(position: usize, text: &str) -> Entry {
            Entry {
                key: EntryKey::sequential(position),
                ordinal: position,
                group: Group::Front,
                anchor_key: EntryKey::sequential(position),
                page_number: None,
                body: EntryBody::Paragraph { text: text.into() },
            }
        }

        #[test]
        fn first_entry_wins_on_duplicate_keys() {
            let mut dup = paragraph(0, "second");
            dup.ordinal = 7;
            let index = EntryIndex::build(Layout::Sections, vec![paragraph(0, "first"), dup]);
            assert_eq!(index.len(), 1);
            assert_eq!(index.get(&EntryKey::from("0")).unwrap().title(), "first");
        }

        #[test]
        fn exposes_order_and_first() {
            let index = EntryIndex::build(
                Layout::Sections,
                (0..3).map(|i| paragraph(i, "p")),
            );
            assert_eq!(index.first().map(|e| e.key.as_str()), Some("0"));
            assert_eq!(index.position(&EntryKey::from("2")), Some(2));
            assert_eq!(index.at(1).map(|e| e.ordinal), Some(1));
            assert_eq!(index.all().count(), 3);
            assert!(EntryIndex::empty(Layout::Calendar).first().is_none());
        }
    }
}

pub mod parser {
    //! Parses user-typed dates into zero-based calendar coordinates.
    //! Accepted: `12-31`, `12/31`, `Dec 31`, `December 31`, `dec. 31`.

    use crate::core::{MonthDay, month_from_name};
    use nom::{
        IResult,
        branch::alt,
        character::complete::{alpha1, char, digit1, space0, space1},
        combinator::{all_consuming, map_opt, map_res, opt},
        sequence::{separated_pair, terminated, tuple},
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DateParseError {
        #[error("unrecognized date {0:?}; expected MM-DD or `Month D`")]
        Syntax(String),
        #[error("{0:?} is not a day of the year")]
        OutOfRange(String),
    }

    /// Months are 1-based in the input and zero-based in the result.
    pub fn parse_month_day(input: &str) -> Result<MonthDay, DateParseError> {
        let trimmed = input.trim();
        let (_, (month, day)) = all_consuming(alt((numeric, named)))(trimmed)
            .map_err(|_| DateParseError::Syntax(trimmed.to_string()))?;
        month
            .checked_sub(1)
            .and_then(|month_index| MonthDay::new(month_index, day).ok())
            .ok_or_else(|| DateParseError::OutOfRange(trimmed.to_string()))
    }

    fn number(i: &str) -> IResult<&str, u32> {
        map_res(digit1, |s: &str| s.parse::<u32>())(i)
    }

    fn numeric(i: &str) -> IResult<&str, (u32, u32)> {
        separated_pair(number, alt((char('-'), char('/'))), number)(i)
    }

    fn named(i: &str) -> IResult<&str, (u32, u32)> {
        let (i, (month, _, _, day, _)) = tuple((
            map_opt(alpha1, |name: &str| month_from_name(name).map(|m| m + 1)),
            opt(char('.')),
            space1,
            number,
            terminated(space0, opt(char(','))),
        ))(i)?;
        Ok((i, (month, day)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn numeric_dates_are_one_based() {
            let date = parse_month_day("12-31").unwrap();
            assert_eq!((date.month_index(), date.day()), (11, 31));
            let date = parse_month_day(" 2/29 ").unwrap();
            assert_eq!((date.month_index(), date.day()), (1, 29));
        }

        #[test]
        fn named_months() {
            let date = parse_month_day("March 4").unwrap();
            assert_eq!((date.month_index(), date.day()), (2, 4));
            let date = parse_month_day("dec. 25").unwrap();
            assert_eq!((date.month_index(), date.day()), (11, 25));
        }

        #[test]
        fn rejects_impossible_and_garbled_dates() {
            assert!(matches!(
                parse_month_day("2-30"),
                Err(DateParseError::OutOfRange(_))
            ));
            assert!(matches!(
                parse_month_day("0-10"),
                Err(DateParseError::OutOfRange(_))
            ));
            assert!(matches!(
                parse_month_day("tomorrow"),
                Err(DateParseError::Syntax(_))
            ));
        }
    }
}

pub mod state {
    //! Local State: the persisted overlay of read flags, notes and the last-visited
    //! pointer, one record per document, stored in a string key-value store.

    use crate::core::{DocumentId, EntryKey};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::{DefaultOnError, serde_as};
    use std::{
        collections::BTreeMap,
        fs, io,
        path::{Path, PathBuf},
    };
    use tracing::{debug, warn};

    pub const KEY_PREFIX: &str = "daybook";
    const LAST_DOCUMENT_KEY: &str = "daybook-prefs:last-document";

    /// Per-document overlay. The JSON shape is `{"notes":{}, "read":{}, "lastSectionId":null}`.
    #[serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LocalState {
        /// Insertion ordered; an empty string means "no note".
        #[serde_as(as = "DefaultOnError")]
        #[serde(default)]
        pub notes: IndexMap<EntryKey, String>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default, rename = "read")]
        pub read_flags: IndexMap<EntryKey, bool>,
        #[serde_as(as = "DefaultOnError")]
        #[serde(default, rename = "lastSectionId", alias = "lastVisitedKey")]
        pub last_visited: Option<EntryKey>,
    }

    impl LocalState {
        pub fn is_read(&self, key: &EntryKey) -> bool {
            self.read_flags.get(key).copied().unwrap_or(false)
        }

        pub fn read_count(&self) -> usize {
            self.read_flags.values().filter(|read| **read).count()
        }

        /// Sets the read flag and the last-visited pointer. Returns whether anything changed.
        pub fn mark_visited(&mut self, key: &EntryKey) -> bool {
            let newly_read = self.read_flags.insert(key.clone(), true) != Some(true);
            let moved = self.last_visited.as_ref() != Some(key);
            self.last_visited = Some(key.clone());
            newly_read || moved
        }

        /// Non-empty note text for `key`.
        pub fn note(&self, key: &EntryKey) -> Option<&str> {
            self.notes
                .get(key)
                .map(String::as_str)
                .filter(|note| !note.is_empty())
        }

        /// Stores the trimmed text; whitespace-only input is stored as an empty string.
        pub fn set_note(&mut self, key: &EntryKey, text: &str) -> bool {
            let trimmed = text.trim();
            match self.notes.get_mut(key) {
                Some(existing) if existing == trimmed => false,
                Some(existing) => {
                    *existing = trimmed.to_string();
                    true
                }
                None => {
                    self.notes.insert(key.clone(), trimmed.to_string());
                    true
                }
            }
        }

        /// Non-empty notes in insertion order.
        pub fn notes_in_order(&self) -> impl Iterator<Item = (&EntryKey, &str)> + '_ {
            self.notes
                .iter()
                .filter(|(_, note)| !note.is_empty())
                .map(|(key, note)| (key, note.as_str()))
        }

        /// Clears notes, read flags and the last-visited pointer; the record stays.
        pub fn reset(&mut self) {
            *self = Self::default();
        }
    }

    /* ---------------------------- Key-value stores ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("writing {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("encoding state: {0}")]
        Encode(#[from] serde_json::Error),
    }

    /// Durable string-keyed, string-valued storage. `set` returns once the value is durable.
    pub trait KeyValueStore {
        fn get(&self, key: &str) -> Option<String>;
        fn set(&mut self, key: &str, value: String) -> Result<(), StoreError>;
    }

    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        values: BTreeMap<String, String>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl KeyValueStore for MemoryStore {
        fn get(&self, key: &str) -> Option<String> {
            self.values.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
            self.values.insert(key.to_string(), value);
            Ok(())
        }
    }

    /// All keys in one JSON object file, rewritten (temp file + rename) on every `set`.
    #[derive(Debug, Clone)]
    pub struct FileStore {
        path: PathBuf,
        values: BTreeMap<String, String>,
    }

    impl FileStore {
        /// Opens the store; a missing or unreadable file starts empty.
        pub fn open(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let values = match fs::read_to_string(&path) {
                Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                    warn!(path = %path.display(), %err, "state file is corrupt; starting empty");
                    BTreeMap::new()
                }),
                Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
                Err(err) => {
                    warn!(path = %path.display(), %err, "state file is unreadable; starting empty");
                    BTreeMap::new()
                }
            };
            Self { path, values }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn flush(&self) -> Result<(), StoreError> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let text = serde_json::to_string_pretty(&self.values)?;
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, text).map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
            fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
            Ok(())
        }
    }

    impl KeyValueStore for FileStore {
        fn get(&self, key: &str) -> Option<String> {
            self.values.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
            self.values.insert(key.to_string(), value);
            self.flush()
        }
    }

    /* ------------------------------ State store ------------------------------ */

    /// Local State records namespaced per document id.
    #[derive(Debug, Clone)]
    pub struct StateStore<S> {
        backend: S,
    }

    impl<S: KeyValueStore> StateStore<S> {
        pub fn new(backend: S) -> Self {
            Self { backend }
        }

        pub fn storage_key(id: &DocumentId) -> String {
            format!("{KEY_PREFIX}:{id}")
        }

        /// Unparsable records silently degrade to an empty state.
        pub fn load(&self, id: &DocumentId) -> LocalState {
            let Some(raw) = self.backend.get(&Self::storage_key(id)) else {
                return LocalState::default();
            };
            serde_json::from_str(&raw).unwrap_or_else(|err| {
                debug!(document = %id, %err, "discarding unreadable local state");
                LocalState::default()
            })
        }

        /// Loads the record, persisting an empty one on first access.
        pub fn load_or_create(&mut self, id: &DocumentId) -> LocalState {
            if self.backend.get(&Self::storage_key(id)).is_some() {
                return self.load(id);
            }
            let state = LocalState::default();
            if let Err(err) = self.save(id, &state) {
                warn!(document = %id, %err, "could not create local state record");
            }
            state
        }

        pub fn save(&mut self, id: &DocumentId, state: &LocalState) -> Result<(), StoreError> {
            let text = serde_json::to_string(state)?;
            self.backend.set(&Self::storage_key(id), text)
        }

        pub fn last_document(&self) -> Option<DocumentId> {
            self.backend
                .get(LAST_DOCUMENT_KEY)
                .filter(|id| !id.trim().is_empty())
                .map(DocumentId)
        }

        pub fn remember_document(&mut self, id: &DocumentId) -> Result<(), StoreError> {
            if self.last_document().as_ref() == Some(id) {
                return Ok(());
            }
            self.backend.set(LAST_DOCUMENT_KEY, id.0.clone())
        }

        pub fn backend(&self) -> &S {
            &self.backend
        }
    }

}

pub mod source {
    //! Document sources and loading. Fetching is the only asynchronous step in the crate.

    use crate::core::{Document, DocumentId};
    use crate::normalize::normalize_document;
    use crate::raw::RawDocument;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use tracing::{debug, info};

    /// One entry of the content catalog.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DocumentSource {
        pub id: DocumentId,
        pub label: String,
        /// `http(s)://` URL, `file://` URL or a plain filesystem path.
        pub url: String,
    }

    impl DocumentSource {
        pub fn new(id: &str, label: &str, url: &str) -> Self {
            Self {
                id: DocumentId::from(id),
                label: label.to_string(),
                url: url.to_string(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum LoadError {
        /// The source needs the network but this context may not fetch.
        #[error("{url} needs network access, which is disabled here")]
        NonNetworkContext { url: String },
        #[error("fetching {url}: {message}")]
        Network { url: String, message: String },
        #[error("fetching {url}: server answered {status}")]
        Status { url: String, status: u16 },
        #[error("reading {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("parsing {url}: {source}")]
        Parse {
            url: String,
            #[source]
            source: serde_json::Error,
        },
    }

    impl LoadError {
        /// Placeholder text shown instead of the document.
        pub fn user_message(&self, label: &str) -> String {
            match self {
                LoadError::NonNetworkContext { .. } => format!(
                    "{label} has to be fetched over the network, and network access is disabled \
                     in this context. Serve the reader over HTTP or allow network access, then reload."
                ),
                LoadError::Network { .. } => format!(
                    "Could not reach the server for {label}. Check your connection and try again."
                ),
                LoadError::Status { status, .. } => {
                    format!("The data for {label} is unavailable right now (HTTP {status}).")
                }
                LoadError::Io { .. } => format!("The data file for {label} could not be opened."),
                LoadError::Parse { .. } => {
                    format!("The data for {label} is damaged and could not be read.")
                }
            }
        }
    }

    /// Fetches document text from the network or the local filesystem.
    #[derive(Debug, Clone)]
    pub struct Fetcher {
        client: reqwest::Client,
        allow_network: bool,
    }

    impl Fetcher {
        pub fn new(allow_network: bool) -> Self {
            Self {
                client: reqwest::Client::new(),
                allow_network,
            }
        }

        pub async fn fetch_text(&self, url: &str) -> Result<String, LoadError> {
            if is_network_url(url) {
                if !self.allow_network {
                    return Err(LoadError::NonNetworkContext {
                        url: url.to_string(),
                    });
                }
                let network = |err: reqwest::Error| LoadError::Network {
                    url: url.to_string(),
                    message: err.to_string(),
                };
                let response = self.client.get(url).send().await.map_err(network)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(LoadError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                return response.text().await.map_err(network);
            }

            let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
            let read = tokio::fs::read_to_string(&path).await;
            read.map_err(|source| LoadError::Io { path, source })
        }
    }

    fn is_network_url(url: &str) -> bool {
        let lower = url.trim_start().to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    /// Parses and normalizes already-fetched document text.
    pub fn parse_document(source: &DocumentSource, text: &str) -> Result<Document, LoadError> {
        let raw = RawDocument::from_json(text).map_err(|err| LoadError::Parse {
            url: source.url.clone(),
            source: err,
        })?;
        Ok(normalize_document(source.id.clone(), source.label.clone(), raw))
    }

    pub async fn load_document(
        fetcher: &Fetcher,
        source: &DocumentSource,
    ) -> Result<Document, LoadError> {
        debug!(document = %source.id, url = %source.url, "fetching document");
        let text = fetcher.fetch_text(&source.url).await?;
        let document = parse_document(source, &text)?;
        info!(
            document = %source.id,
            entries = document.entries.len(),
            layout = ?document.info.layout,
            "document loaded"
        );
        Ok(document)
    }

}

pub mod search {
    //! Filter/Search Engine: category filtering, case- and accent-insensitive matching,
    //! literal highlighting and paged results.

    use crate::core::{Entry, EntryKey, Filter, Layout};
    use crate::index::EntryIndex;
    use crate::normalize::normalize_text;
    use regex::{Regex, RegexBuilder};
    use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};
    use tracing::debug;

    pub const MIN_QUERY_CHARS: usize = 2;
    pub const DEFAULT_PAGE_SIZE: usize = 20;
    pub const HIGHLIGHT_OPEN: &str = "<mark>";
    pub const HIGHLIGHT_CLOSE: &str = "</mark>";

    /// Text normalization + accent stripping + quote folding + lowercase.
    pub fn fold_for_search(text: &str) -> String {
        normalize_text(text)
            .nfd()
            .filter(|c| !is_combining_mark(*c))
            .map(fold_quote)
            .flat_map(char::to_lowercase)
            .collect()
    }

    fn fold_quote(c: char) -> char {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' | '`' | '\u{00b4}' | '\u{2032}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{00ab}' | '\u{00bb}' | '\u{2033}' => '"',
            other => other,
        }
    }

    /// A search query long enough to filter by. Shorter input means "no query".
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Query {
        raw: String,
        folded: String,
    }

    impl Query {
        pub fn parse(input: &str) -> Option<Self> {
            let raw = input.trim();
            if raw.chars().count() < MIN_QUERY_CHARS {
                return None;
            }
            Some(Self {
                raw: raw.to_string(),
                folded: fold_for_search(raw),
            })
        }

        /// Trimmed text as typed; used for highlighting.
        pub fn raw(&self) -> &str {
            &self.raw
        }

        pub fn folded(&self) -> &str {
            &self.folded
        }
    }

    /// Category filter only, preserving document order.
    pub fn compute_visible<'a>(
        entries: impl IntoIterator<Item = &'a Entry>,
        filter: Filter,
    ) -> Vec<&'a Entry> {
        entries
            .into_iter()
            .filter(|entry| filter.admits(entry.group))
            .collect()
    }

    /// Matches the entry's text fields (plus `note`, when given) against a parsed query.
    pub fn matches(entry: &Entry, query: &Query, note: Option<&str>) -> bool {
        let haystack = entry
            .text_fields()
            .into_iter()
            .chain(note)
            .collect::<Vec<_>>()
            .join("\n");
        fold_for_search(&haystack).contains(query.folded())
    }

    /// Like [`matches`], but an empty or too-short query matches everything.
    pub fn matches_query(entry: &Entry, query: &str, note: Option<&str>) -> bool {
        Query::parse(query).is_none_or(|q| matches(entry, &q, note))
    }

    pub fn escape_html(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                other => out.push(other),
            }
        }
        out
    }

    fn literal_pattern(query: &str) -> Option<Regex> {
        let needle = query.trim();
        if needle.is_empty() {
            return None;
        }
        RegexBuilder::new(&regex::escape(needle))
            .case_insensitive(true)
            .build()
            .ok()
    }

    /// Byte offset of the first case-insensitive literal occurrence of `query`.
    pub fn first_match(text: &str, query: &str) -> Option<usize> {
        literal_pattern(query)?.find(text).map(|found| found.start())
    }

    /// Escapes `text` for display and wraps each case-insensitive literal occurrence of `query`.
    pub fn highlight(text: &str, query: &str) -> String {
        let Some(pattern) = literal_pattern(query) else {
            return escape_html(text);
        };

        let mut out = String::with_capacity(text.len() + 16);
        let mut last = 0;
        for found in pattern.find_iter(text) {
            out.push_str(&escape_html(&text[last..found.start()]));
            out.push_str(HIGHLIGHT_OPEN);
            out.push_str(&escape_html(found.as_str()));
            out.push_str(HIGHLIGHT_CLOSE);
            last = found.end();
        }
        out.push_str(&escape_html(&text[last..]));
        out
    }

    /// Matches revealed a page at a time, in document order.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ResultPage {
        matches: Vec<EntryKey>,
        page_size: usize,
        revealed: usize,
    }

    impl ResultPage {
        pub fn new(matches: Vec<EntryKey>, page_size: usize) -> Self {
            let page_size = page_size.max(1);
            let revealed = page_size.min(matches.len());
            Self {
                matches,
                page_size,
                revealed,
            }
        }

        pub fn matches(&self) -> &[EntryKey] {
            &self.matches
        }

        pub fn shown(&self) -> &[EntryKey] {
            &self.matches[..self.revealed]
        }

        pub fn total(&self) -> usize {
            self.matches.len()
        }

        pub fn has_more(&self) -> bool {
            self.revealed < self.matches.len()
        }

        /// Extends the window by one page, saturating at the match count.
        pub fn reveal_more(&mut self) -> usize {
            self.revealed = (self.revealed + self.page_size).min(self.matches.len());
            self.revealed
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct CacheKey {
        filter: Filter,
        query: Option<String>,
        notes_revision: u64,
    }

    /// Memoized filter + query evaluation. Recomputes only when the filter, the folded
    /// query or the notes revision differs from the cached inputs.
    #[derive(Debug, Clone)]
    pub struct SearchEngine {
        page_size: usize,
        cached: Option<CacheKey>,
        filtered: Vec<EntryKey>,
        results: ResultPage,
    }

    impl SearchEngine {
        pub fn new(page_size: usize) -> Self {
            Self {
                page_size,
                cached: None,
                filtered: Vec::new(),
                results: ResultPage::new(Vec::new(), page_size),
            }
        }

        /// Returns whether the results were recomputed.
        pub fn refresh<'n>(
            &mut self,
            index: &EntryIndex,
            filter: Filter,
            query: Option<&Query>,
            notes_revision: u64,
            note_for: impl Fn(&EntryKey) -> Option<&'n str>,
        ) -> bool {
            let key = CacheKey {
                filter,
                query: query.map(|q| q.folded().to_string()),
                notes_revision,
            };
            if self.cached.as_ref() == Some(&key) {
                return false;
            }

            let filtered = compute_visible(index.all(), filter);
            let matched = filtered
                .iter()
                .filter(|entry| query.is_none_or(|q| matches(entry, q, note_for(&entry.key))))
                .map(|entry| entry.key.clone())
                .collect::<Vec<_>>();
            debug!(
                filter = %filter,
                query = ?key.query,
                filtered = filtered.len(),
                matched = matched.len(),
                "search recomputed"
            );
            self.filtered = filtered.into_iter().map(|entry| entry.key.clone()).collect();
            self.results = ResultPage::new(matched, self.page_size);
            self.cached = Some(key);
            true
        }

        pub fn invalidate(&mut self) {
            self.cached = None;
        }

        /// Keys surviving the category filter.
        pub fn filtered(&self) -> &[EntryKey] {
            &self.filtered
        }

        /// Keys surviving the filter and the query (the visible set).
        pub fn visible(&self) -> &[EntryKey] {
            self.results.matches()
        }

        pub fn results(&self) -> &ResultPage {
            &self.results
        }

        pub fn reveal_more(&mut self) -> usize {
            self.results.reveal_more()
        }

        /// `"3 matches of 40"` while searching, `"40 sections"` otherwise.
        pub fn count_label(&self, searching: bool, layout: Layout) -> String {
            let filtered = self.filtered.len();
            if searching {
                let found = self.results.total();
                let plural = if found == 1 { "" } else { "es" };
                format!("{found} match{plural} of {filtered}")
            } else {
                format!("{filtered} {}", layout.noun())
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{DayReflection, EntryBody, Group, MonthDay};

        fn paragraph(position: usize, group: Group, text: &str) -> Entry {
            Entry {
                key: EntryKey::sequential(position),
                ordinal: position,
                group,
                anchor_key: EntryKey::sequential(position),
                page_number: None,
                body: EntryBody::Paragraph { text: text.into() },
            }
        }

        fn reflection(month: u32, day: u32, title: &str, body: &str) -> Entry {
            let date = MonthDay::new(month, day).unwrap();
            Entry {
                key: EntryKey::calendar(date),
                ordinal: 0,
                group: Group::Month(month),
                anchor_key: EntryKey::calendar(date),
                page_number: None,
                body: EntryBody::DayReflection(DayReflection {
                    date,
                    title: title.into(),
                    quote: String::new(),
                    body: body.into(),
                    source: None,
                }),
            }
        }

        #[test]
        fn empty_and_short_queries_match_everything() {
            let entry = paragraph(0, Group::Front, "Anything");
            assert!(matches_query(&entry, "", None));
            assert!(matches_query(&entry, "   ", None));
            assert!(matches_query(&entry, "z", None));
            assert!(!matches_query(&entry, "zz", None));
        }

        #[test]
        fn matching_ignores_case_accents_and_quote_style() {
            let entry = paragraph(0, Group::Front, "Caf\u{e9} on the corner");
            assert!(matches_query(&entry, "cafe", None));
            assert!(matches_query(&entry, "CAFÉ", None));
            let quoted = paragraph(1, Group::Front, "It\u{2019}s \u{201c}enough\u{201d}");
            assert!(matches_query(&quoted, "it's \"enough\"", None));
        }

        #[test]
        fn notes_participate_when_supplied() {
            let entry = reflection(0, 5, "Humility", "Body text");
            assert!(!matches_query(&entry, "gratitude", None));
            assert!(matches_query(&entry, "gratitude", Some("Gratitude list")));
        }

        #[test]
        fn visible_set_respects_category_and_order() {
            let entries = vec![
                paragraph(0, Group::Front, "a"),
                paragraph(1, Group::Steps, "b"),
                paragraph(2, Group::Traditions, "c"),
                paragraph(3, Group::Steps, "d"),
            ];
            assert_eq!(compute_visible(&entries, Filter::All).len(), 4);
            let steps: Vec<&str> = compute_visible(&entries, Filter::Group(Group::Steps))
                .into_iter()
                .map(|e| e.key.as_str())
                .collect();
            assert_eq!(steps, vec!["1", "3"]);
        }

        #[test]
        fn highlight_escapes_and_marks_literal_matches() {
            assert_eq!(
                highlight("Fish & <chips> fish", "FISH"),
                "<mark>Fish</mark> &amp; &lt;chips&gt; <mark>fish</mark>"
            );
            assert_eq!(highlight("a.b axb", "a.b"), "<mark>a.b</mark> axb");
            assert_eq!(highlight("it's", ""), "it&#39;s");
        }

        #[test]
        fn reveal_more_saturates() {
            let keys = (0..45).map(EntryKey::sequential).collect();
            let mut page = ResultPage::new(keys, 20);
            assert_eq!(page.shown().len(), 20);
            assert_eq!(page.reveal_more(), 40);
            assert_eq!(page.reveal_more(), 45);
            assert_eq!(page.reveal_more(), 45);
            assert!(!page.has_more());
        }

        #[test]
        fn engine_memoizes_on_normalized_query() {
            let index = EntryIndex::build(
                Layout::Sections,
                vec![
                    paragraph(0, Group::Front, "Serenity"),
                    paragraph(1, Group::Steps, "Courage"),
                ],
            );
            let mut engine = SearchEngine::new(DEFAULT_PAGE_SIZE);
            let none = |_: &EntryKey| None;
            assert!(engine.refresh(&index, Filter::All, None, 0, none));
            assert!(!engine.refresh(&index, Filter::All, None, 0, none));
            assert_eq!(engine.count_label(false, Layout::Sections), "2 sections");

            let q = Query::parse("  SERENITY ").unwrap();
            assert!(engine.refresh(&index, Filter::All, Some(&q), 0, none));
            let same = Query::parse("serenity").unwrap();
            assert!(!engine.refresh(&index, Filter::All, Some(&same), 0, none));
            assert_eq!(engine.visible(), &[EntryKey::from("0")]);
            assert_eq!(engine.count_label(true, Layout::Sections), "1 match of 2");

            engine.invalidate();
            assert!(engine.refresh(&index, Filter::All, Some(&same), 0, none));
        }
    }
}

pub mod navigation {
    //! Navigation Resolver. Each operation yields the next current entry or a `Miss`;
    //! on a miss the caller leaves its current entry alone.

    use crate::core::*;
    use crate::index::EntryIndex;
    use crate::state::LocalState;
    use chrono::NaiveDate;
    use rand::Rng;

    /// Probe bound for calendar stepping over sparse or empty documents.
    pub const STEP_PROBE_LIMIT: usize = 370;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum Miss {
        #[error("nothing to show yet")]
        Empty,
        #[error("today's reading is only available for daily documents")]
        NotCalendar,
        #[error("no entry for {0}")]
        NoEntry(String),
        #[error("no entry within {} days", STEP_PROBE_LIMIT)]
        Exhausted,
        #[error("already at the {0} entry")]
        Boundary(&'static str),
    }

    /// Today's coordinate, falling back to the first entry when today has no reading.
    pub fn resolve_today(index: &EntryIndex, today: NaiveDate) -> Result<&Entry, Miss> {
        if index.layout() != Layout::Calendar {
            return Err(Miss::NotCalendar);
        }
        index
            .get_month_day(MonthDay::from_date(today))
            .or_else(|| index.first())
            .ok_or(Miss::Empty)
    }

    /// Exact lookup. Calendar keys are re-derived with the build rule first, so `"02-5"`
    /// and `"2-5"` address the same day.
    pub fn resolve_explicit<'a>(index: &'a EntryIndex, key: &EntryKey) -> Result<&'a Entry, Miss> {
        let date = match index.layout() {
            Layout::Calendar => key.month_day(),
            Layout::Sections => None,
        };
        let canonical = date.map(EntryKey::calendar).unwrap_or_else(|| key.clone());
        index.get(&canonical).ok_or_else(|| {
            Miss::NoEntry(date.map(MonthDay::label).unwrap_or_else(|| key.to_string()))
        })
    }

    /// Uniform choice over all entries.
    pub fn resolve_random<'a, R: Rng>(index: &'a EntryIndex, rng: &mut R) -> Option<&'a Entry> {
        if index.is_empty() {
            return None;
        }
        index.at(rng.gen_range(0..index.len()))
    }

    /// Advances the coordinate one day at a time until an entry exists.
    pub fn step_calendar(
        index: &EntryIndex,
        from: MonthDay,
        direction: Direction,
    ) -> Result<&Entry, Miss> {
        let mut probe = from;
        for _ in 0..STEP_PROBE_LIMIT {
            probe = probe.step(direction);
            if let Some(entry) = index.get_month_day(probe) {
                return Ok(entry);
            }
        }
        Err(Miss::Exhausted)
    }

    /// Neighbour of `from` inside `visible`; the first visible key when `from` is not in it.
    pub fn step_within<'a>(
        visible: &'a [EntryKey],
        from: &EntryKey,
        direction: Direction,
    ) -> Result<&'a EntryKey, Miss> {
        let Some(pos) = visible.iter().position(|key| key == from) else {
            return visible.first().ok_or(Miss::Empty);
        };
        let next = match direction {
            Direction::Forward => visible.get(pos + 1),
            Direction::Backward => pos.checked_sub(1).and_then(|p| visible.get(p)),
        };
        next.ok_or(match direction {
            Direction::Forward => Miss::Boundary("last"),
            Direction::Backward => Miss::Boundary("first"),
        })
    }

    /// "Continue" target: the last visited entry if it still resolves, else the first visible one.
    pub fn resume_target<'a>(
        index: &'a EntryIndex,
        state: &LocalState,
        visible: &[EntryKey],
    ) -> Option<&'a Entry> {
        state
            .last_visited
            .as_ref()
            .and_then(|key| index.get(key))
            .or_else(|| visible.first().and_then(|key| index.get(key)))
    }

    /// Records progress for `entry` unless tracking is suppressed by an active search.
    pub fn mark_visited(state: &mut LocalState, entry: &Entry, suppressed: bool) -> bool {
        if suppressed {
            return false;
        }
        state.mark_visited(&entry.key)
    }

}

pub mod view {
    //! View Synchronizer: one pure function from session inputs to a complete view model.
    //! Every dependent display is derived here; nothing is patched in place.

    use crate::core::*;
    use crate::index::EntryIndex;
    use crate::navigation::resume_target;
    use crate::search::{
        DEFAULT_PAGE_SIZE, Query, SearchEngine, first_match, fold_for_search, highlight,
    };
    use crate::state::LocalState;
    use serde::{Deserialize, Serialize};

    const SNIPPET_CONTEXT_CHARS: usize = 160;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ViewSettings {
        pub page_size: usize,
        pub note_previews: usize,
        pub note_snippet_chars: usize,
    }

    impl Default for ViewSettings {
        fn default() -> Self {
            Self {
                page_size: DEFAULT_PAGE_SIZE,
                note_previews: 5,
                note_snippet_chars: 60,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "phase", rename_all = "kebab-case")]
    pub enum Phase {
        Pending,
        Failed { message: String },
        Ready,
    }

    /* ------------------------------- View model ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Header {
        pub title: String,
        pub eyebrow: String,
        pub author: Option<String>,
        pub subject: Option<String>,
        /// `By X | N pages | Created D`
        pub meta_line: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct EntryView {
        pub key: EntryKey,
        pub kind: EntryKind,
        pub group: String,
        pub title: String,
        pub date_label: Option<String>,
        pub quote: Option<String>,
        pub body: Option<String>,
        pub items: Vec<String>,
        pub source: Option<String>,
        /// `Page N | Group`
        pub meta_label: String,
        pub read: bool,
        pub status_label: &'static str,
        pub note: String,
        pub note_open: bool,
        pub note_toggle_label: &'static str,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Progress {
        pub read: usize,
        pub total: usize,
        pub percent: u32,
        pub label: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Resume {
        pub label: &'static str,
        pub target: Option<EntryKey>,
        pub enabled: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct OutlineItem {
        pub key: EntryKey,
        pub title: String,
        pub level: u8,
        pub active: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CalendarDay {
        pub day: u32,
        /// `None` when the document has no reading for this day.
        pub key: Option<EntryKey>,
        pub read: bool,
        pub has_note: bool,
        pub active: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CalendarMonth {
        pub month_index: u32,
        pub name: &'static str,
        pub days: Vec<CalendarDay>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct FilterChip {
        pub value: Filter,
        pub label: &'static str,
        pub active: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SearchHit {
        pub key: EntryKey,
        pub title_html: String,
        pub snippet_html: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SearchView {
        pub query: String,
        pub active: bool,
        pub count_label: String,
        pub total: usize,
        pub shown: usize,
        pub has_more: bool,
        pub results: Vec<SearchHit>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct NotePreview {
        pub key: EntryKey,
        pub title: String,
        pub snippet: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ViewModel {
        #[serde(flatten)]
        pub phase: Phase,
        pub header: Header,
        /// Explanatory text shown in place of content while pending or after a failed load.
        pub placeholder: Option<String>,
        pub current: Option<EntryView>,
        pub progress: Progress,
        pub resume: Resume,
        pub active_anchor: Option<EntryKey>,
        pub outline: Vec<OutlineItem>,
        pub calendar: Option<CalendarMonth>,
        pub filters: Vec<FilterChip>,
        pub search: SearchView,
        pub visible: Vec<EntryKey>,
        pub notes: Vec<NotePreview>,
        pub status: Option<String>,
    }

    /// Everything the synchronizer reads. `search` must already be refreshed for
    /// `filter` and `query`.
    #[derive(Debug, Clone, Copy)]
    pub struct ViewInput<'a> {
        pub info: &'a DocumentInfo,
        pub phase: &'a Phase,
        pub index: &'a EntryIndex,
        pub current: Option<&'a EntryKey>,
        pub filter: Filter,
        pub query_text: &'a str,
        pub query: Option<&'a Query>,
        pub search: &'a SearchEngine,
        pub local: &'a LocalState,
        /// Whether the current entry's note panel was toggled away from its default.
        pub note_toggled: bool,
        pub status: Option<&'a str>,
        pub settings: ViewSettings,
    }

    pub fn synchronize(input: &ViewInput<'_>) -> ViewModel {
        let index = input.index;
        let layout = index.layout();
        let current = input.current.and_then(|key| index.get(key));
        let active_anchor = current.map(|entry| entry.anchor_key.clone());

        ViewModel {
            phase: input.phase.clone(),
            header: header(input.info),
            placeholder: match input.phase {
                Phase::Pending => Some(format!("Loading {}...", input.info.label)),
                Phase::Failed { message } => Some(message.clone()),
                Phase::Ready if index.is_empty() => {
                    Some(format!("{} has no {} to show.", input.info.label, layout.noun()))
                }
                Phase::Ready => None,
            },
            current: current.map(|entry| entry_view(entry, input)),
            progress: progress(input.local, index),
            resume: resume(input),
            outline: outline(input, active_anchor.as_ref()),
            calendar: calendar(input, current),
            active_anchor,
            filters: Filter::choices(layout)
                .into_iter()
                .map(|value| FilterChip {
                    value,
                    label: value.label(),
                    active: value == input.filter,
                })
                .collect(),
            search: search_view(input),
            visible: input.search.visible().to_vec(),
            notes: note_previews(input),
            status: input.status.map(str::to_string),
        }
    }

    fn header(info: &DocumentInfo) -> Header {
        let meta = &info.metadata;
        let parts: Vec<String> = [
            meta.author.as_ref().map(|author| format!("By {author}")),
            meta.page_count.map(|pages| format!("{pages} pages")),
            meta.creation_date.as_ref().map(|date| format!("Created {date}")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Header {
            title: meta.title.clone().unwrap_or_else(|| info.label.clone()),
            eyebrow: info.label.clone(),
            author: meta.author.clone(),
            subject: meta.subject.clone(),
            meta_line: (!parts.is_empty()).then(|| parts.join(" | ")),
        }
    }

    fn entry_view(entry: &Entry, input: &ViewInput<'_>) -> EntryView {
        let read = input.local.is_read(&entry.key);
        let note = input.local.note(&entry.key).unwrap_or_default().to_string();
        let has_note = !note.is_empty();
        let note_open = has_note != input.note_toggled;

        let meta_label = entry
            .page_number
            .map(|page| format!("Page {page}"))
            .into_iter()
            .chain([entry.group.label().to_string()])
            .collect::<Vec<_>>()
            .join(" | ");

        let (date_label, quote, body, items, source) = match &entry.body {
            EntryBody::DayReflection(day) => (
                Some(day.date.label()),
                Some(day.quote.clone()).filter(|q| !q.is_empty()),
                Some(day.body.clone()),
                Vec::new(),
                day.source.clone(),
            ),
            EntryBody::List { items, .. } => (None, None, None, items.clone(), None),
            EntryBody::Heading { .. } | EntryBody::Paragraph { .. } => {
                (None, None, None, Vec::new(), None)
            }
        };

        EntryView {
            key: entry.key.clone(),
            kind: entry.kind(),
            group: entry.group.label().to_string(),
            title: entry.title().to_string(),
            date_label,
            quote,
            body,
            items,
            source,
            meta_label,
            read,
            status_label: if read { "Read" } else { "Unread" },
            note,
            note_open,
            note_toggle_label: match (note_open, has_note) {
                (true, _) => "Hide note",
                (false, true) => "Show note",
                (false, false) => "Add note",
            },
        }
    }

    /// Read flags over total entries, rounded to the nearest percent and clamped to 100.
    pub fn progress(local: &LocalState, index: &EntryIndex) -> Progress {
        let read = local.read_count();
        let total = index.len();
        let percent = if total == 0 {
            0
        } else {
            ((read as f64 * 100.0 / total as f64).round() as u32).min(100)
        };
        Progress {
            read,
            total,
            percent,
            label: format!(
                "{read} of {total} {} read ({percent}%)",
                index.layout().noun()
            ),
        }
    }

    fn resume(input: &ViewInput<'_>) -> Resume {
        let target = resume_target(input.index, input.local, input.search.visible())
            .map(|entry| entry.key.clone());
        Resume {
            label: if input.local.last_visited.is_some() {
                "Continue"
            } else {
                "Start"
            },
            enabled: target.is_some(),
            target,
        }
    }

    fn outline(input: &ViewInput<'_>, active: Option<&EntryKey>) -> Vec<OutlineItem> {
        input
            .search
            .filtered()
            .iter()
            .filter_map(|key| input.index.get(key))
            .filter_map(|entry| match &entry.body {
                EntryBody::Heading { text, level } => Some(OutlineItem {
                    key: entry.key.clone(),
                    title: text.clone(),
                    level: *level,
                    active: Some(&entry.key) == active,
                }),
                _ => None,
            })
            .collect()
    }

    fn calendar(input: &ViewInput<'_>, current: Option<&Entry>) -> Option<CalendarMonth> {
        if input.index.layout() != Layout::Calendar {
            return None;
        }
        let focus = current
            .or_else(|| input.index.first())
            .and_then(Entry::month_day)?;
        let month_index = focus.month_index();
        let days = (1..=DAYS_IN_MONTH[month_index as usize])
            .filter_map(|day| MonthDay::new(month_index, day).ok())
            .map(|date| {
                let key = input.index.get_month_day(date).map(|entry| entry.key.clone());
                CalendarDay {
                    day: date.day(),
                    read: key.as_ref().is_some_and(|k| input.local.is_read(k)),
                    has_note: key.as_ref().is_some_and(|k| input.local.note(k).is_some()),
                    active: key.is_some() && key.as_ref() == current.map(|entry| &entry.key),
                    key,
                }
            })
            .collect();
        Some(CalendarMonth {
            month_index,
            name: focus.month_name(),
            days,
        })
    }

    fn search_view(input: &ViewInput<'_>) -> SearchView {
        let page = input.search.results();
        let raw = input.query.map(Query::raw).unwrap_or_default();
        let results = match input.query {
            Some(_) => page
                .shown()
                .iter()
                .filter_map(|key| input.index.get(key))
                .map(|entry| SearchHit {
                    key: entry.key.clone(),
                    title_html: highlight(entry.title(), raw),
                    snippet_html: highlight(&excerpt(entry, raw), raw),
                })
                .collect(),
            None => Vec::new(),
        };
        SearchView {
            query: input.query_text.to_string(),
            active: input.query.is_some(),
            count_label: input
                .search
                .count_label(input.query.is_some(), input.index.layout()),
            total: page.total(),
            shown: page.shown().len(),
            has_more: page.has_more(),
            results,
        }
    }

    /// Body text around the first literal hit, falling back to the start of the body.
    fn excerpt(entry: &Entry, query: &str) -> String {
        let folded = fold_for_search(query);
        let fields = entry.text_fields();
        let body: Vec<&str> = fields.into_iter().skip(1).filter(|f| !f.is_empty()).collect();
        let Some(text) = body
            .iter()
            .find(|field| fold_for_search(field).contains(&folded))
            .or(body.first())
        else {
            return String::new();
        };

        let start_char = first_match(text, query)
            .map(|byte| text[..byte].chars().count())
            .unwrap_or(0)
            .saturating_sub(SNIPPET_CONTEXT_CHARS / 3);
        let tail: String = text.chars().skip(start_char).collect();
        let clipped = truncate_chars(&tail, SNIPPET_CONTEXT_CHARS);
        if start_char > 0 {
            format!("...{clipped}")
        } else {
            clipped
        }
    }

    /// First `max` characters, with `...` when something was cut.
    pub fn truncate_chars(text: &str, max: usize) -> String {
        let text = text.trim();
        if text.chars().count() <= max {
            return text.to_string();
        }
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut.trim_end())
    }

    fn note_previews(input: &ViewInput<'_>) -> Vec<NotePreview> {
        input
            .local
            .notes_in_order()
            .take(input.settings.note_previews)
            .map(|(key, note)| NotePreview {
                key: key.clone(),
                title: input
                    .index
                    .get(key)
                    .map(|entry| entry.title().to_string())
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| "Note".to_string()),
                snippet: truncate_chars(note, input.settings.note_snippet_chars),
            })
            .collect()
    }

}

pub mod share {
    //! Plain-text export of one entry, for clipboard or platform share handoff.

    use crate::core::*;

    pub fn share_text(info: &DocumentInfo, entry: &Entry) -> String {
        let mut lines: Vec<String> = Vec::new();
        match &entry.body {
            EntryBody::DayReflection(day) => {
                lines.push(day.title.clone());
                lines.push(day.date.label());
                if !day.quote.is_empty() {
                    lines.push(String::new());
                    lines.push(format!("\"{}\"", day.quote));
                }
                if !day.body.is_empty() {
                    lines.push(String::new());
                    lines.push(day.body.clone());
                }
                if let Some(source) = &day.source {
                    lines.push(format!("- {source}"));
                }
            }
            EntryBody::List { text, items } => {
                lines.push(text.clone());
                lines.extend(items.iter().map(|item| format!("- {item}")));
            }
            EntryBody::Heading { text, .. } | EntryBody::Paragraph { text } => {
                lines.push(text.clone());
            }
        }
        lines.push(String::new());
        lines.push(info.metadata.title.clone().unwrap_or_else(|| info.label.clone()));
        lines.join("\n")
    }

}

pub mod session {
    //! The explicit reading session: one loaded document, its index, its Local State
    //! and the transient view state. A document switch replaces the whole session.

    use crate::core::*;
    use crate::index::EntryIndex;
    use crate::navigation::{self, Miss};
    use crate::search::{Query, SearchEngine};
    use crate::share::share_text;
    use crate::source::{DocumentSource, LoadError};
    use crate::state::{KeyValueStore, LocalState, StateStore};
    use crate::view::{Phase, ViewInput, ViewModel, ViewSettings, synchronize};
    use chrono::NaiveDate;
    use rand::Rng;
    use std::collections::HashSet;
    use tracing::{debug, warn};

    /// User-facing actions. Each one is followed by a fresh view model.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Action {
        Today,
        Random,
        Step(Direction),
        Explicit(EntryKey),
        Resume,
        SetFilter(Filter),
        SetQuery(String),
        RevealMore,
        ToggleNoteOpen,
        EditNote { key: EntryKey, text: String },
        ResetProgress,
        /// Delivered by the rendering layer when an entry enters the viewport.
        MarkVisited(EntryKey),
    }

    #[derive(Debug, Clone)]
    pub struct Session {
        info: DocumentInfo,
        phase: Phase,
        index: EntryIndex,
        local: LocalState,
        current: Option<EntryKey>,
        filter: Filter,
        query_text: String,
        query: Option<Query>,
        search: SearchEngine,
        note_toggles: HashSet<EntryKey>,
        notes_revision: u64,
        status: Option<String>,
        settings: ViewSettings,
    }

    impl Session {
        fn blank(info: DocumentInfo, phase: Phase, settings: ViewSettings) -> Self {
            Self {
                index: EntryIndex::empty(info.layout),
                info,
                phase,
                local: LocalState::default(),
                current: None,
                filter: Filter::All,
                query_text: String::new(),
                query: None,
                search: SearchEngine::new(settings.page_size),
                note_toggles: HashSet::new(),
                notes_revision: 0,
                status: None,
                settings,
            }
        }

        fn placeholder_info(source: &DocumentSource) -> DocumentInfo {
            DocumentInfo {
                id: source.id.clone(),
                label: source.label.clone(),
                layout: Layout::default(),
                metadata: DocumentMetadata::default(),
            }
        }

        /// Load in flight: every action is a no-op.
        pub fn pending(source: &DocumentSource, settings: ViewSettings) -> Self {
            Self::blank(Self::placeholder_info(source), Phase::Pending, settings)
        }

        /// Load failed: empty index, placeholder message, every action a no-op.
        pub fn failed(source: &DocumentSource, message: String, settings: ViewSettings) -> Self {
            Self::blank(
                Self::placeholder_info(source),
                Phase::Failed { message },
                settings,
            )
        }

        /// Calendar documents open on today's reading; section documents on the resume target.
        pub fn ready(
            document: Document,
            local: LocalState,
            settings: ViewSettings,
            today: NaiveDate,
        ) -> Self {
            let Document { info, entries } = document;
            let mut session = Self::blank(info, Phase::Ready, settings);
            session.index = EntryIndex::build(session.info.layout, entries);
            session.local = local;
            session.refresh_search();
            session.current = match session.info.layout {
                Layout::Calendar => navigation::resolve_today(&session.index, today).ok(),
                Layout::Sections => {
                    navigation::resume_target(&session.index, &session.local, session.search.visible())
                }
            }
            .map(|entry| entry.key.clone());
            session
        }

        pub fn info(&self) -> &DocumentInfo {
            &self.info
        }

        pub fn phase(&self) -> &Phase {
            &self.phase
        }

        pub fn index(&self) -> &EntryIndex {
            &self.index
        }

        pub fn local(&self) -> &LocalState {
            &self.local
        }

        pub fn current(&self) -> Option<&Entry> {
            self.current.as_ref().and_then(|key| self.index.get(key))
        }

        pub fn filter(&self) -> Filter {
            self.filter
        }

        pub fn query(&self) -> Option<&Query> {
            self.query.as_ref()
        }

        pub fn status(&self) -> Option<&str> {
            self.status.as_deref()
        }

        pub(crate) fn set_status(&mut self, message: impl Into<String>) {
            self.status = Some(message.into());
        }

        /// An active search suppresses progress tracking; a category filter alone does not.
        pub fn progress_suppressed(&self) -> bool {
            self.query.is_some()
        }

        /// Applies one action. Returns whether Local State changed and needs persisting.
        /// The status message from the previous action is cleared first.
        pub fn apply<R: Rng>(&mut self, action: Action, today: NaiveDate, rng: &mut R) -> bool {
            self.status = None;
            if self.phase != Phase::Ready {
                debug!(?action, "ignored; no document loaded");
                return false;
            }

            match action {
                Action::Today => {
                    let target = navigation::resolve_today(&self.index, today)
                        .map(|entry| entry.key.clone());
                    self.land(target)
                }
                Action::Random => {
                    match navigation::resolve_random(&self.index, rng).map(|e| e.key.clone()) {
                        Some(key) => self.go_to(key),
                        None => false,
                    }
                }
                Action::Step(direction) => {
                    let target = self.step_target(direction);
                    self.land(target)
                }
                Action::Explicit(key) => {
                    let target = navigation::resolve_explicit(&self.index, &key)
                        .map(|entry| entry.key.clone());
                    self.land(target)
                }
                Action::Resume => {
                    let target =
                        navigation::resume_target(&self.index, &self.local, self.search.visible())
                            .map(|entry| entry.key.clone())
                            .ok_or(Miss::Empty);
                    self.land(target)
                }
                Action::SetFilter(filter) => {
                    self.filter = filter;
                    self.refresh_search();
                    false
                }
                Action::SetQuery(text) => {
                    self.query = Query::parse(&text);
                    self.query_text = text;
                    self.refresh_search();
                    false
                }
                Action::RevealMore => {
                    self.search.reveal_more();
                    false
                }
                Action::ToggleNoteOpen => {
                    if let Some(key) = self.current.clone() {
                        if !self.note_toggles.remove(&key) {
                            self.note_toggles.insert(key);
                        }
                    }
                    false
                }
                Action::EditNote { key, text } => {
                    if self.index.get(&key).is_none() {
                        self.miss(Miss::NoEntry(key.to_string()));
                        return false;
                    }
                    let changed = self.local.set_note(&key, &text);
                    if changed && self.index.layout() == Layout::Calendar {
                        self.notes_revision += 1;
                        self.refresh_search();
                    }
                    changed
                }
                Action::ResetProgress => {
                    self.local.reset();
                    self.note_toggles.clear();
                    self.notes_revision += 1;
                    self.refresh_search();
                    true
                }
                Action::MarkVisited(key) => {
                    let suppressed = self.progress_suppressed();
                    match self.index.get(&key) {
                        Some(entry) => navigation::mark_visited(&mut self.local, entry, suppressed),
                        None => false,
                    }
                }
            }
        }

        fn step_target(&self, direction: Direction) -> Result<EntryKey, Miss> {
            let current = self.current.as_ref().ok_or(Miss::Empty)?;
            match self.index.layout() {
                Layout::Calendar => {
                    let from = current.month_day().ok_or(Miss::Empty)?;
                    navigation::step_calendar(&self.index, from, direction)
                        .map(|entry| entry.key.clone())
                }
                Layout::Sections => {
                    navigation::step_within(self.search.visible(), current, direction).cloned()
                }
            }
        }

        fn land(&mut self, target: Result<EntryKey, Miss>) -> bool {
            match target {
                Ok(key) => self.go_to(key),
                Err(miss) => {
                    self.miss(miss);
                    false
                }
            }
        }

        fn miss(&mut self, miss: Miss) {
            debug!(%miss, "navigation miss");
            self.status = Some(miss.to_string());
        }

        /// Calendar navigation counts as reading the day; section documents rely on
        /// viewport events instead.
        fn go_to(&mut self, key: EntryKey) -> bool {
            let track = self.index.layout() == Layout::Calendar && !self.progress_suppressed();
            let changed = track && self.local.mark_visited(&key);
            self.current = Some(key);
            changed
        }

        fn refresh_search(&mut self) {
            let local = &self.local;
            let with_notes = self.index.layout() == Layout::Calendar;
            self.search.refresh(
                &self.index,
                self.filter,
                self.query.as_ref(),
                self.notes_revision,
                |key| if with_notes { local.note(key) } else { None },
            );
        }

        pub fn view(&self) -> ViewModel {
            synchronize(&ViewInput {
                info: &self.info,
                phase: &self.phase,
                index: &self.index,
                current: self.current.as_ref(),
                filter: self.filter,
                query_text: &self.query_text,
                query: self.query.as_ref(),
                search: &self.search,
                local: &self.local,
                note_toggled: self
                    .current
                    .as_ref()
                    .is_some_and(|key| self.note_toggles.contains(key)),
                status: self.status.as_deref(),
                settings: self.settings,
            })
        }

        /// Plain-text export of the current entry.
        pub fn share(&self) -> Option<String> {
            self.current().map(|entry| share_text(&self.info, entry))
        }
    }

    /* ------------------------------ Reader shell ------------------------------ */

    /// Owns the persistent store and the current session; persists Local State after
    /// every action that changed it.
    #[derive(Debug)]
    pub struct Reader<S> {
        store: StateStore<S>,
        settings: ViewSettings,
        session: Session,
    }

    impl<S: KeyValueStore> Reader<S> {
        pub fn new(store: StateStore<S>, settings: ViewSettings, source: &DocumentSource) -> Self {
            Self {
                store,
                settings,
                session: Session::pending(source, settings),
            }
        }

        pub fn session(&self) -> &Session {
            &self.session
        }

        pub fn store(&self) -> &StateStore<S> {
            &self.store
        }

        /// Begins loading `source`; the previous session is discarded.
        pub fn begin(&mut self, source: &DocumentSource) -> ViewModel {
            self.session = Session::pending(source, self.settings);
            self.session.view()
        }

        /// Installs the load result. Index and Local State are replaced together.
        pub fn open(
            &mut self,
            source: &DocumentSource,
            loaded: Result<Document, LoadError>,
            today: NaiveDate,
        ) -> ViewModel {
            self.session = match loaded {
                Ok(document) => {
                    let local = self.store.load_or_create(&document.info.id);
                    Session::ready(document, local, self.settings, today)
                }
                Err(err) => {
                    warn!(document = %source.id, %err, "document failed to load");
                    Session::failed(source, err.user_message(&source.label), self.settings)
                }
            };
            if let Err(err) = self.store.remember_document(&source.id) {
                warn!(%err, "could not remember the selected document");
            }
            self.session.view()
        }

        pub fn apply(&mut self, action: Action) -> ViewModel {
            let today = chrono::Local::now().date_naive();
            self.apply_with(action, today, &mut rand::thread_rng())
        }

        pub fn apply_with<R: Rng>(&mut self, action: Action, today: NaiveDate, rng: &mut R) -> ViewModel {
            if self.session.apply(action, today, rng) {
                let id = self.session.info().id.clone();
                if let Err(err) = self.store.save(&id, self.session.local()) {
                    warn!(document = %id, %err, "could not persist local state");
                    self.session
                        .set_status("Your progress could not be saved on this device.");
                }
            }
            self.session.view()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::state::MemoryStore;
        use rand::{SeedableRng, rngs::StdRng};

        fn day(month: u32, d: u32, ordinal: usize, body: &str) -> Entry {
            let date = MonthDay::new(month, d).unwrap();
            Entry {
                key: EntryKey::calendar(date),
                ordinal,
                group: Group::Month(month),
                anchor_key: EntryKey::calendar(date),
                page_number: None,
                body: EntryBody::DayReflection(DayReflection {
                    date,
                    title: date.label(),
                    quote: String::new(),
                    body: body.into(),
                    source: None,
                }),
            }
        }

        fn calendar_doc() -> Document {
            Document {
                info: DocumentInfo {
                    id: DocumentId::from("daily"),
                    label: "Daily".into(),
                    layout: Layout::Calendar,
                    metadata: DocumentMetadata::default(),
                },
                entries: vec![
                    day(0, 1, 0, "serenity"),
                    day(0, 2, 1, "courage"),
                    day(0, 5, 2, "wisdom"),
                ],
            }
        }

        fn date(m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2026, m, d).unwrap()
        }

        fn rng() -> StdRng {
            StdRng::seed_from_u64(1)
        }

        #[test]
        fn opens_on_today_and_misses_keep_the_current_entry() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 2));
            assert_eq!(session.current().unwrap().key.as_str(), "0-2");

            assert!(!session.apply(Action::Explicit(EntryKey::from("0-3")), date(1, 2), &mut rng()));
            assert_eq!(session.current().unwrap().key.as_str(), "0-2");
            assert_eq!(session.status(), Some("no entry for January 3"));

            // status clears on the next action
            session.apply(Action::RevealMore, date(1, 2), &mut rng());
            assert_eq!(session.status(), None);
        }

        #[test]
        fn calendar_steps_skip_gaps_and_mark_read() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 2));
            assert!(session.apply(Action::Step(Direction::Forward), date(1, 2), &mut rng()));
            assert_eq!(session.current().unwrap().key.as_str(), "0-5");
            assert!(session.local().is_read(&EntryKey::from("0-5")));
            session.apply(Action::Step(Direction::Backward), date(1, 2), &mut rng());
            assert_eq!(session.current().unwrap().key.as_str(), "0-2");
        }

        #[test]
        fn active_search_suppresses_progress_but_filters_do_not() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 2));
            session.apply(Action::SetQuery("wis".into()), date(1, 2), &mut rng());
            assert!(!session.apply(Action::Explicit(EntryKey::from("0-5")), date(1, 2), &mut rng()));
            assert!(!session.apply(Action::MarkVisited(EntryKey::from("0-1")), date(1, 2), &mut rng()));
            assert_eq!(session.local().read_count(), 0);

            session.apply(Action::SetQuery(" ".into()), date(1, 2), &mut rng());
            session.apply(Action::SetFilter(Filter::Group(Group::Month(0))), date(1, 2), &mut rng());
            assert!(session.apply(Action::MarkVisited(EntryKey::from("0-1")), date(1, 2), &mut rng()));
            assert_eq!(session.local().read_count(), 1);
        }

        #[test]
        fn notes_feed_calendar_search() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 2));
            session.apply(Action::SetQuery("gratitude".into()), date(1, 2), &mut rng());
            assert!(session.view().visible.is_empty());
            assert!(session.apply(
                Action::EditNote {
                    key: EntryKey::from("0-1"),
                    text: " Gratitude list ".into()
                },
                date(1, 2),
                &mut rng()
            ));
            assert_eq!(session.view().visible, vec![EntryKey::from("0-1")]);
        }

        #[test]
        fn note_panel_toggles_against_its_default() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 1));
            assert!(!session.view().current.unwrap().note_open);
            session.apply(Action::ToggleNoteOpen, date(1, 1), &mut rng());
            assert!(session.view().current.unwrap().note_open);
        }

        #[test]
        fn reset_clears_local_state_and_keeps_the_index() {
            let mut session =
                Session::ready(calendar_doc(), LocalState::default(), ViewSettings::default(), date(1, 1));
            session.apply(Action::Step(Direction::Forward), date(1, 1), &mut rng());
            session.apply(
                Action::EditNote {
                    key: EntryKey::from("0-2"),
                    text: "note".into(),
                },
                date(1, 1),
                &mut rng(),
            );
            assert!(session.apply(Action::ResetProgress, date(1, 1), &mut rng()));
            assert_eq!(session.local(), &LocalState::default());
            assert_eq!(session.index().len(), 3);
            assert_eq!(session.view().resume.label, "Start");
        }

        #[test]
        fn failed_sessions_ignore_every_action() {
            let source = DocumentSource::new("a", "Book A", "https://example.com/a.json");
            let mut session = Session::failed(&source, "offline".into(), ViewSettings::default());
            for action in [
                Action::Today,
                Action::Random,
                Action::Step(Direction::Forward),
                Action::ResetProgress,
            ] {
                assert!(!session.apply(action, date(1, 1), &mut rng()));
            }
            let view = session.view();
            assert_eq!(view.placeholder.as_deref(), Some("offline"));
            assert!(view.current.is_none());
        }

        #[test]
        fn reader_persists_changes_and_swaps_documents() {
            let source = DocumentSource::new("daily", "Daily", "data/daily.json");
            let mut reader = Reader::new(
                StateStore::new(MemoryStore::new()),
                ViewSettings::default(),
                &source,
            );
            reader.open(&source, Ok(calendar_doc()), date(1, 1));
            reader.apply_with(Action::Step(Direction::Forward), date(1, 1), &mut rng());
            assert_eq!(reader.store().load(&DocumentId::from("daily")).read_count(), 1);
            assert_eq!(reader.store().last_document(), Some(DocumentId::from("daily")));

            let other = DocumentSource::new("b", "Book B", "https://example.com/b.json");
            let view = reader.open(
                &other,
                Err(LoadError::NonNetworkContext {
                    url: other.url.clone(),
                }),
                date(1, 1),
            );
            assert!(view.placeholder.unwrap().contains("Book B"));
            assert!(reader.session().index().is_empty());
        }
    }
}

pub mod config {
    //! TOML configuration: where state lives, page sizes and the document catalog.

    use crate::source::DocumentSource;
    use crate::view::ViewSettings;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        pub state_path: Option<PathBuf>,
        /// Disallows network fetches; URL sources then fail with a non-network-context message.
        pub offline: bool,
        pub page_size: usize,
        pub note_previews: usize,
        pub note_snippet_chars: usize,
        pub default_source: Option<String>,
        pub sources: Vec<DocumentSource>,
    }

    impl Default for Config {
        fn default() -> Self {
            let view = ViewSettings::default();
            Self {
                state_path: None,
                offline: false,
                page_size: view.page_size,
                note_previews: view.note_previews,
                note_snippet_chars: view.note_snippet_chars,
                default_source: None,
                sources: vec![
                    DocumentSource::new("source-a", "Twelve and Twelve", "data/twlvxtwlv.json"),
                    DocumentSource::new(
                        "source-b",
                        "Twelve Steps",
                        "data/twelve_steps_structured.json",
                    ),
                    DocumentSource::new("daily", "Daily Reflections", "data/daily_reflections.json"),
                ],
            }
        }
    }

    impl Config {
        pub fn view_settings(&self) -> ViewSettings {
            ViewSettings {
                page_size: self.page_size.max(1),
                note_previews: self.note_previews,
                note_snippet_chars: self.note_snippet_chars.max(1),
            }
        }

        pub fn state_path(&self) -> PathBuf {
            self.state_path.clone().unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("daybook")
                    .join("state.json")
            })
        }

        /// Picks a source: the requested id, else the remembered one, else
        /// `default_source`, else the first in the catalog.
        pub fn source(&self, requested: Option<&str>, remembered: Option<&str>) -> Result<&DocumentSource> {
            if let Some(id) = requested {
                return self
                    .find(id)
                    .with_context(|| format!("unknown source {id:?}; see `daybook sources`"));
            }
            remembered
                .and_then(|id| self.find(id))
                .or_else(|| self.default_source.as_deref().and_then(|id| self.find(id)))
                .or_else(|| self.sources.first())
                .context("no document sources configured")
        }

        fn find(&self, id: &str) -> Option<&DocumentSource> {
            self.sources.iter().find(|source| source.id.0 == id)
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("daybook").join("config.toml"))
    }

    pub fn parse_config(text: &str) -> Result<Config> {
        toml::from_str(text).context("parsing configuration")
    }

    /// Reads `explicit` (which must exist) or the default path (which may be absent).
    pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Config::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        parse_config(&text).with_context(|| format!("in {}", path.display()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_keys_take_defaults() {
            let config = parse_config("offline = true\npage_size = 5\n").unwrap();
            assert!(config.offline);
            assert_eq!(config.view_settings().page_size, 5);
            assert_eq!(config.note_previews, 5);
            assert_eq!(config.sources.len(), 3);
        }

        #[test]
        fn custom_sources_replace_the_catalog() {
            let config = parse_config(
                r#"
default_source = "mine"

[[sources]]
id = "other"
label = "Other"
url = "other.json"

[[sources]]
id = "mine"
label = "Mine"
url = "https://example.com/mine.json"
"#,
            )
            .unwrap();
            assert_eq!(config.source(None, None).unwrap().label, "Mine");
            assert_eq!(config.source(None, Some("other")).unwrap().label, "Other");
            assert_eq!(config.source(None, Some("gone")).unwrap().label, "Mine");
            assert!(config.source(Some("gone"), None).is_err());
        }

        #[test]
        fn zero_page_size_is_clamped() {
            let config = parse_config("page_size = 0").unwrap();
            assert_eq!(config.view_settings().page_size, 1);
        }
    }
}
