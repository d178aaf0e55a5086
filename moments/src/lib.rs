//! Task-document library: a line-oriented parser for indentation-based task files,
//! recurrence expansion into concrete calendar instances, and line-range edits that
//! leave every untouched line of the source text alone.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::ops::RangeInclusive;

    /* ---------------------------- Coordinates ---------------------------- */

    /// Location of a syntactic element in the source text.
    ///
    /// `line_number` is 0-based; `offset` counts characters from the start of the
    /// document (line terminators included) and `length` counts characters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DocCoords {
        pub line_number: usize,
        pub offset: usize,
        pub length: usize,
    }

    impl DocCoords {
        pub fn new(line_number: usize, offset: usize, length: usize) -> Self {
            Self {
                line_number,
                offset,
                length,
            }
        }

        /// Cut the addressed element out of the document it was parsed from.
        pub fn slice<'a>(&self, text: &'a str) -> &'a str {
            let mut bounds = text
                .char_indices()
                .map(|(idx, _)| idx)
                .chain(std::iter::once(text.len()));
            let Some(start) = bounds.nth(self.offset) else {
                return "";
            };
            let end = if self.length == 0 {
                start
            } else {
                bounds.nth(self.length - 1).unwrap_or(text.len())
            };
            &text[start..end]
        }
    }

    /* ------------------------------- IDs ------------------------------- */

    /// Index into `Todos::categories`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CategoryId(pub usize);

    /// Child-index path from `Todos::moments` down to a nested moment.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MomentPath(pub Vec<usize>);

    impl MomentPath {
        pub fn depth(&self) -> usize {
            self.0.len().saturating_sub(1)
        }
    }

    /// Lookup-only link from a moment to the category it sits under.
    ///
    /// Parsed moments carry the index of the declaring category; moments built in
    /// code only need the name, which is what insertion groups by.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CategoryRef {
        pub id: Option<CategoryId>,
        pub name: String,
    }

    impl CategoryRef {
        pub fn named(name: impl Into<String>) -> Self {
            Self {
                id: None,
                name: name.into(),
            }
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Root of a parsed document. Owns every moment and category.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Todos {
        #[serde(default)]
        pub categories: Vec<Category>,
        #[serde(default)]
        pub moments: Vec<Moment>,
        /// Identifier -> location of the moment that declared it (last one wins).
        #[serde(default)]
        pub ids: IndexMap<String, MomentPath>,
    }

    impl Todos {
        pub fn moment_at(&self, path: &MomentPath) -> Option<&Moment> {
            let (first, rest) = path.0.split_first()?;
            let mut moment = self.moments.get(*first)?;
            for idx in rest {
                moment = moment.children.get(*idx)?;
            }
            Some(moment)
        }

        pub fn moment_by_id(&self, id: &str) -> Option<&Moment> {
            self.ids.get(id).and_then(|path| self.moment_at(path))
        }

        pub fn category(&self, id: CategoryId) -> Option<&Category> {
            self.categories.get(id.0)
        }

        /// Resolve a moment's category, by index when known and by name otherwise.
        pub fn category_of(&self, moment: &Moment) -> Option<&Category> {
            let reference = moment.category.as_ref()?;
            match reference.id {
                Some(id) => self.category(id),
                None => self.categories.iter().find(|c| c.name == reference.name),
            }
        }

        /// All moments in document order, paired with their nesting depth.
        pub fn walk(&self) -> Vec<(usize, &Moment)> {
            fn visit<'a>(moment: &'a Moment, depth: usize, out: &mut Vec<(usize, &'a Moment)>) {
                out.push((depth, moment));
                for child in &moment.children {
                    visit(child, depth + 1, out);
                }
            }

            let mut out = Vec::new();
            for moment in &self.moments {
                visit(moment, 0, &mut out);
            }
            out
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Category {
        pub name: String,
        pub priority: u32,
        pub color: Option<String>,
        /// Position of the name line inside the delimiter block.
        pub coords: DocCoords,
    }

    impl Category {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                priority: 0,
                color: None,
                coords: DocCoords::default(),
            }
        }
    }

    /// A task entry, single or recurring, with its comments and sub-moments.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Moment {
        pub name: String,
        #[serde(default)]
        pub state: WorkState,
        #[serde(default)]
        pub priority: u32,
        pub category: Option<CategoryRef>,
        pub id: Option<Identifier>,
        pub time_of_day: Option<TimeOfDay>,
        pub schedule: Schedule,
        #[serde(default)]
        pub comments: Vec<Comment>,
        #[serde(default)]
        pub children: Vec<Moment>,
        /// The whole declaration line.
        #[serde(default)]
        pub coords: DocCoords,
    }

    impl Moment {
        /// An undated moment in state `New`.
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                state: WorkState::New,
                priority: 0,
                category: None,
                id: None,
                time_of_day: None,
                schedule: Schedule::Single {
                    start: None,
                    end: None,
                },
                comments: Vec::new(),
                children: Vec::new(),
                coords: DocCoords::default(),
            }
        }

        pub fn recurring(name: impl Into<String>, recurrence: Recurrence) -> Self {
            Self {
                schedule: Schedule::Recurring { recurrence },
                ..Self::new(name)
            }
        }

        pub fn with_state(mut self, state: WorkState) -> Self {
            self.state = state;
            self
        }

        pub fn with_priority(mut self, priority: u32) -> Self {
            self.priority = priority;
            self
        }

        pub fn with_category(mut self, name: impl Into<String>) -> Self {
            self.category = Some(CategoryRef::named(name));
            self
        }

        pub fn with_id(mut self, value: impl Into<String>) -> Self {
            self.id = Some(Identifier {
                value: value.into(),
                coords: DocCoords::default(),
            });
            self
        }

        /// Bound a single moment by calendar days; the end is normalized to end-of-day.
        pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
            self.schedule = Schedule::Single {
                start: start.map(|d| Date::new(start_of_day(d))),
                end: end.map(|d| Date::new(end_of_day(d))),
            };
            self
        }

        pub fn with_time(mut self, time: NaiveTime) -> Self {
            self.time_of_day = Some(TimeOfDay {
                time,
                coords: DocCoords::default(),
            });
            self
        }

        pub fn with_comment(mut self, content: impl Into<String>) -> Self {
            self.comments.push(Comment {
                content: content.into(),
                coords: DocCoords::default(),
            });
            self
        }

        pub fn with_child(mut self, child: Moment) -> Self {
            self.children.push(child);
            self
        }

        pub fn is_done(&self) -> bool {
            self.state == WorkState::Done
        }

        pub fn is_recurring(&self) -> bool {
            matches!(self.schedule, Schedule::Recurring { .. })
        }

        pub fn id_value(&self) -> Option<&str> {
            self.id.as_ref().map(|id| id.value.as_str())
        }

        pub fn start(&self) -> Option<&Date> {
            match &self.schedule {
                Schedule::Single { start, .. } => start.as_ref(),
                Schedule::Recurring { .. } => None,
            }
        }

        pub fn end(&self) -> Option<&Date> {
            match &self.schedule {
                Schedule::Single { end, .. } => end.as_ref(),
                Schedule::Recurring { .. } => None,
            }
        }

        pub fn recurrence(&self) -> Option<&Recurrence> {
            match &self.schedule {
                Schedule::Recurring { recurrence } => Some(recurrence),
                Schedule::Single { .. } => None,
            }
        }

        /// Last source line that belongs to this moment: its own line, its last
        /// comment, or the bottom of its last child, whichever is lowest.
        pub fn bottom_line_number(&self) -> usize {
            let mut bottom = self.coords.line_number;
            if let Some(comment) = self.comments.last() {
                bottom = bottom.max(comment.coords.line_number);
            }
            if let Some(child) = self.children.last() {
                bottom = bottom.max(child.bottom_line_number());
            }
            bottom
        }

        pub fn line_range(&self) -> RangeInclusive<usize> {
            self.coords.line_number..=self.bottom_line_number()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum WorkState {
        #[default]
        New,
        Done,
        InProgress,
        Waiting,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Schedule {
        /// Either bound may be missing, meaning unbounded on that side.
        Single {
            start: Option<Date>,
            end: Option<Date>,
        },
        Recurring { recurrence: Recurrence },
    }

    /// A timestamp plus the source span it was read from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Date {
        pub time: NaiveDateTime,
        #[serde(default)]
        pub coords: DocCoords,
    }

    impl Date {
        pub fn new(time: NaiveDateTime) -> Self {
            Self {
                time,
                coords: DocCoords::default(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimeOfDay {
        pub time: NaiveTime,
        #[serde(default)]
        pub coords: DocCoords,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RecurrenceKind {
        Daily,
        Weekly,
        BiWeekly,
        TriWeekly,
        QuadriWeekly,
        Monthly,
        Yearly,
    }

    impl RecurrenceKind {
        /// Week cadence of the weekly kinds.
        pub fn week_interval(self) -> Option<u32> {
            match self {
                RecurrenceKind::Weekly => Some(1),
                RecurrenceKind::BiWeekly => Some(2),
                RecurrenceKind::TriWeekly => Some(3),
                RecurrenceKind::QuadriWeekly => Some(4),
                _ => None,
            }
        }

        pub fn from_week_interval(weeks: u32) -> Option<Self> {
            match weeks {
                1 => Some(RecurrenceKind::Weekly),
                2 => Some(RecurrenceKind::BiWeekly),
                3 => Some(RecurrenceKind::TriWeekly),
                4 => Some(RecurrenceKind::QuadriWeekly),
                _ => None,
            }
        }
    }

    /// Periodic rule anchored to a reference date (weekday, day of month or day of year).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Recurrence {
        pub kind: RecurrenceKind,
        pub reference: Date,
    }

    impl Recurrence {
        pub fn new(kind: RecurrenceKind, reference: NaiveDate) -> Self {
            Self {
                kind,
                reference: Date::new(start_of_day(reference)),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Comment {
        pub content: String,
        #[serde(default)]
        pub coords: DocCoords,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Identifier {
        pub value: String,
        /// Starts at the `#`.
        #[serde(default)]
        pub coords: DocCoords,
    }

    /* ---------------------------- Day boundaries ---------------------------- */

    pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN)
    }

    pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
        let last = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).expect("valid end-of-day time");
        date.and_time(last)
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Structural failure of a parse. Line numbers are 1-based.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ParseError {
        #[error("line {line}: expected a category name after the delimiter, but reached the end")]
        MissingCategoryName { line: usize },
        #[error("line {line}: expected a delimiter after category {category}, but reached the end")]
        UnterminatedCategory { line: usize, category: String },
        #[error("line {line}: expected a delimiter after category {category}, got {found}")]
        MismatchedDelimiter {
            line: usize,
            category: String,
            found: String,
        },
    }

    impl ParseError {
        pub fn line(&self) -> usize {
            match self {
                ParseError::MissingCategoryName { line }
                | ParseError::UnterminatedCategory { line, .. }
                | ParseError::MismatchedDelimiter { line, .. } => *line,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day(d: u32, m: u32, y: i32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn at_line(moment: Moment, line: usize) -> Moment {
            Moment {
                coords: DocCoords::new(line, 0, 0),
                ..moment
            }
        }

        #[test]
        fn bottom_line_follows_deepest_child() {
            let grandchild = at_line(Moment::new("c"), 7);
            let child = at_line(Moment::new("b"), 5).with_child(grandchild);
            let mut parent = at_line(Moment::new("a"), 2).with_child(child);
            parent.comments.push(Comment {
                content: "note".into(),
                coords: DocCoords::new(3, 0, 4),
            });

            assert_eq!(parent.bottom_line_number(), 7);
            assert_eq!(parent.line_range(), 2..=7);
        }

        #[test]
        fn bottom_line_uses_trailing_comment() {
            let child = at_line(Moment::new("b"), 3);
            let mut parent = at_line(Moment::new("a"), 2).with_child(child);
            parent.comments.push(Comment {
                content: "late".into(),
                coords: DocCoords::new(4, 0, 4),
            });
            assert_eq!(parent.bottom_line_number(), 4);
            assert_eq!(at_line(Moment::new("lone"), 9).bottom_line_number(), 9);
        }

        #[test]
        fn with_dates_normalizes_end_of_day() {
            let moment = Moment::new("trip").with_dates(Some(day(18, 6, 2016)), Some(day(25, 6, 2016)));
            let start = moment.start().expect("start");
            let end = moment.end().expect("end");
            assert_eq!(start.time, start_of_day(day(18, 6, 2016)));
            assert_eq!(end.time.date(), day(25, 6, 2016));
            assert_eq!(end.time, end_of_day(day(25, 6, 2016)));
            assert!(end.time > start_of_day(day(25, 6, 2016)));
        }

        #[test]
        fn slice_uses_character_offsets() {
            let text = "\n[] äö\n\thehe ää";
            assert_eq!(DocCoords::new(1, 1, 5).slice(text), "[] äö");
            assert_eq!(DocCoords::new(2, 8, 7).slice(text), "hehe ää");
            assert_eq!(DocCoords::new(0, 40, 3).slice(text), "");
        }

        #[test]
        fn moment_lookup_by_path_and_id() {
            let mut todos = Todos::default();
            todos.moments.push(Moment::new("top").with_child(Moment::new("nested").with_id("n-1")));
            todos
                .ids
                .insert("n-1".into(), MomentPath(vec![0, 0]));

            let found = todos.moment_by_id("n-1").expect("moment by id");
            assert_eq!(found.name, "nested");
            assert!(todos.moment_by_id("missing").is_none());
            assert_eq!(MomentPath(vec![0, 0]).depth(), 1);

            let names: Vec<_> = todos.walk().into_iter().map(|(d, m)| (d, m.name.as_str())).collect();
            assert_eq!(names, vec![(0, "top"), (1, "nested")]);
        }

        #[test]
        fn category_of_falls_back_to_name() {
            let mut todos = Todos::default();
            todos.categories.push(Category::new("work"));
            let moment = Moment::new("x").with_category("work");
            assert_eq!(todos.category_of(&moment).map(|c| c.name.as_str()), Some("work"));
            assert!(todos.category_of(&Moment::new("y")).is_none());
        }

        #[test]
        fn parse_error_reports_line() {
            let err = ParseError::MismatchedDelimiter {
                line: 4,
                category: "cat".into(),
                found: "[] x".into(),
            };
            assert_eq!(err.line(), 4);
            assert_eq!(err.to_string(), "line 4: expected a delimiter after category cat, got [] x");
        }
    }
}

pub mod config {
    //! Tokens and patterns that shape the document syntax.
    //!
    //! `Settings` is the plain, serde-friendly description. `ParseConfig` is the
    //! compiled form (regexes, weekday tables) handed to the parser, serializer and
    //! editor by reference.

    use chrono::{NaiveDate, NaiveTime, Weekday};
    use regex::Regex;
    use serde::{Deserialize, Serialize};

    const WEEKDAYS_FROM_SUNDAY: [Weekday; 7] = [
        Weekday::Sun,
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        pub category_delim: String,
        /// One level of indentation.
        pub indent: String,
        pub lbracket: String,
        pub rbracket: char,
        pub priority_mark: char,
        pub done_mark: char,
        pub in_progress_mark: char,
        pub waiting_mark: char,
        /// chrono format strings, tried in order.
        pub date_formats: Vec<String>,
        pub output_date_format: String,
        pub time_format: String,
        /// Seven names, Sunday first.
        pub week_days: Vec<String>,
        /// Names for the 2nd, 3rd and 4th week cadence.
        pub nths: Vec<String>,
        pub daily_pattern: String,
        pub weekly_pattern: String,
        pub nth_weekly_pattern: String,
        pub monthly_pattern: String,
        pub yearly_pattern: String,
    }

    impl Default for Settings {
        fn default() -> Self {
            let days = "monday|tuesday|wednesday|thursday|friday|saturday|sunday";
            Self {
                category_delim: "------".into(),
                indent: "\t".into(),
                lbracket: "[".into(),
                rbracket: ']',
                priority_mark: '!',
                done_mark: 'x',
                in_progress_mark: 'p',
                waiting_mark: 'w',
                date_formats: vec!["%d.%m.%y".into(), "%d.%m.%Y".into()],
                output_date_format: "%d.%m.%Y".into(),
                time_format: "%H:%M".into(),
                week_days: [
                    "sunday",
                    "monday",
                    "tuesday",
                    "wednesday",
                    "thursday",
                    "friday",
                    "saturday",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                nths: vec!["2nd".into(), "3rd".into(), "4th".into()],
                daily_pattern: "(every day|today)".into(),
                weekly_pattern: format!("every ({days})"),
                nth_weekly_pattern: format!("every (2nd|3rd|4th) ({days})"),
                monthly_pattern: r"every (\d{1,2})\.?$".into(),
                yearly_pattern: r"every (\d{1,2})\.(\d{1,2})\.?$".into(),
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("setting `{0}` must not be empty")]
        EmptyToken(&'static str),
        #[error("expected 7 weekday names starting with sunday, got {0}")]
        WeekdayCount(usize),
        #[error("at most 3 nth names are supported, got {0}")]
        TooManyNths(usize),
        #[error("invalid {name} pattern: {source}")]
        Pattern {
            name: &'static str,
            #[source]
            source: regex::Error,
        },
    }

    /// Compiled, immutable configuration.
    #[derive(Debug, Clone)]
    pub struct ParseConfig {
        settings: Settings,
        week_days: Vec<(String, Weekday)>,
        nths: Vec<(String, u32)>,
        daily: Regex,
        weekly: Regex,
        nth_weekly: Regex,
        monthly: Regex,
        yearly: Regex,
    }

    impl ParseConfig {
        pub fn new(settings: Settings) -> Result<Self, ConfigError> {
            if settings.category_delim.is_empty() {
                return Err(ConfigError::EmptyToken("category_delim"));
            }
            if settings.indent.is_empty() {
                return Err(ConfigError::EmptyToken("indent"));
            }
            if settings.lbracket.is_empty() {
                return Err(ConfigError::EmptyToken("lbracket"));
            }
            if settings.date_formats.is_empty() {
                return Err(ConfigError::EmptyToken("date_formats"));
            }
            if settings.week_days.len() != 7 {
                return Err(ConfigError::WeekdayCount(settings.week_days.len()));
            }
            if settings.nths.len() > 3 {
                return Err(ConfigError::TooManyNths(settings.nths.len()));
            }

            let week_days = settings
                .week_days
                .iter()
                .zip(WEEKDAYS_FROM_SUNDAY)
                .map(|(name, day)| (name.to_lowercase(), day))
                .collect();
            let nths = settings
                .nths
                .iter()
                .zip(2u32..)
                .map(|(name, n)| (name.to_lowercase(), n))
                .collect();

            Ok(Self {
                daily: compile("daily", &settings.daily_pattern)?,
                weekly: compile("weekly", &settings.weekly_pattern)?,
                nth_weekly: compile("nth weekly", &settings.nth_weekly_pattern)?,
                monthly: compile("monthly", &settings.monthly_pattern)?,
                yearly: compile("yearly", &settings.yearly_pattern)?,
                week_days,
                nths,
                settings,
            })
        }

        pub fn settings(&self) -> &Settings {
            &self.settings
        }

        pub fn daily_pattern(&self) -> &Regex {
            &self.daily
        }

        pub fn weekly_pattern(&self) -> &Regex {
            &self.weekly
        }

        pub fn nth_weekly_pattern(&self) -> &Regex {
            &self.nth_weekly
        }

        pub fn monthly_pattern(&self) -> &Regex {
            &self.monthly
        }

        pub fn yearly_pattern(&self) -> &Regex {
            &self.yearly
        }

        pub fn weekday(&self, name: &str) -> Option<Weekday> {
            let name = name.to_lowercase();
            self.week_days
                .iter()
                .find(|(candidate, _)| *candidate == name)
                .map(|(_, day)| *day)
        }

        pub fn weekday_name(&self, day: Weekday) -> &str {
            &self.settings.week_days[day.num_days_from_sunday() as usize]
        }

        pub fn nth(&self, name: &str) -> Option<u32> {
            let name = name.to_lowercase();
            self.nths
                .iter()
                .find(|(candidate, _)| *candidate == name)
                .map(|(_, n)| *n)
        }

        pub fn nth_name(&self, weeks: u32) -> Option<&str> {
            self.nths
                .iter()
                .position(|(_, n)| *n == weeks)
                .map(|idx| self.settings.nths[idx].as_str())
        }

        pub fn parse_date(&self, text: &str) -> Option<NaiveDate> {
            let text = text.trim();
            self.settings
                .date_formats
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        }

        pub fn parse_time(&self, text: &str) -> Option<NaiveTime> {
            NaiveTime::parse_from_str(text.trim(), &self.settings.time_format).ok()
        }

        pub fn format_date(&self, date: NaiveDate) -> String {
            date.format(&self.settings.output_date_format).to_string()
        }

        pub fn format_time(&self, time: NaiveTime) -> String {
            time.format(&self.settings.time_format).to_string()
        }
    }

    impl Default for ParseConfig {
        fn default() -> Self {
            Self::new(Settings::default()).expect("default settings compile")
        }
    }

    fn compile(name: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
        let pattern = if pattern.starts_with("(?i)") {
            pattern.to_string()
        } else {
            format!("(?i){pattern}")
        };
        Regex::new(&pattern).map_err(|source| ConfigError::Pattern { name, source })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn default_config_compiles_case_insensitive_patterns() {
            let config = ParseConfig::default();
            assert!(config.daily_pattern().is_match("Every Day"));
            assert!(config.weekly_pattern().is_match("every MONDAY"));
            let caps = config
                .nth_weekly_pattern()
                .captures("every 3rd friday")
                .expect("nth weekly match");
            assert_eq!(&caps[1], "3rd");
            assert_eq!(&caps[2], "friday");
            assert!(config.monthly_pattern().is_match("every 5."));
            assert!(!config.monthly_pattern().is_match("every 2.5.2015"));
            assert!(config.yearly_pattern().is_match("every 2.5."));
            assert!(!config.yearly_pattern().is_match("every 2.5.2015"));
        }

        #[test]
        fn weekday_tables_start_on_sunday() {
            let config = ParseConfig::default();
            assert_eq!(config.weekday("Sunday"), Some(Weekday::Sun));
            assert_eq!(config.weekday("thursday"), Some(Weekday::Thu));
            assert_eq!(config.weekday("someday"), None);
            assert_eq!(config.weekday_name(Weekday::Wed), "wednesday");
            assert_eq!(config.nth("2ND"), Some(2));
            assert_eq!(config.nth("4th"), Some(4));
            assert_eq!(config.nth_name(3), Some("3rd"));
            assert_eq!(config.nth_name(5), None);
        }

        #[test]
        fn dates_try_two_digit_year_first() {
            let config = ParseConfig::default();
            assert_eq!(
                config.parse_date("24.12.15"),
                NaiveDate::from_ymd_opt(2015, 12, 24)
            );
            assert_eq!(
                config.parse_date(" 4.1.2015 "),
                NaiveDate::from_ymd_opt(2015, 1, 4)
            );
            assert_eq!(config.parse_date("4.1.asfasf"), None);
            assert_eq!(config.parse_time("13:15"), NaiveTime::from_hms_opt(13, 15, 0));
            assert_eq!(
                config.format_date(NaiveDate::from_ymd_opt(2019, 1, 2).expect("date")),
                "02.01.2019"
            );
        }

        #[test]
        fn rejects_broken_settings() {
            let settings = Settings {
                indent: String::new(),
                ..Settings::default()
            };
            assert!(matches!(
                ParseConfig::new(settings),
                Err(ConfigError::EmptyToken("indent"))
            ));

            let settings = Settings {
                week_days: vec!["monday".into()],
                ..Settings::default()
            };
            assert!(matches!(
                ParseConfig::new(settings),
                Err(ConfigError::WeekdayCount(1))
            ));

            let settings = Settings {
                monthly_pattern: "every (".into(),
                ..Settings::default()
            };
            match ParseConfig::new(settings) {
                Err(ConfigError::Pattern { name, .. }) => assert_eq!(name, "monthly"),
                other => panic!("expected pattern error, got {:?}", other),
            }
        }

        #[test]
        fn settings_round_trip_through_json_with_defaults() {
            let parsed: Settings =
                serde_json::from_str(r#"{ "indent": "  ", "done_mark": "d" }"#).expect("settings json");
            assert_eq!(parsed.indent, "  ");
            assert_eq!(parsed.done_mark, 'd');
            assert_eq!(parsed.category_delim, "------");
            ParseConfig::new(parsed).expect("custom settings compile");
        }
    }
}

pub mod scanner {
    //! Splits raw text into numbered lines with byte and character offsets, and
    //! hands them out one at a time with a single line of pushback.

    use crate::core::DocCoords;
    use serde::{Deserialize, Serialize};

    const NEWLINE_SNIFF_BYTES: usize = 512;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Newline {
        #[default]
        Lf,
        CrLf,
    }

    impl Newline {
        /// Decide from the first line break within the leading bytes.
        pub fn detect(text: &str) -> Self {
            let head = &text.as_bytes()[..text.len().min(NEWLINE_SNIFF_BYTES)];
            match head.iter().position(|b| *b == b'\n') {
                Some(pos) if pos > 0 && head[pos - 1] == b'\r' => Newline::CrLf,
                _ => Newline::Lf,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Newline::Lf => "\n",
                Newline::CrLf => "\r\n",
            }
        }
    }

    /// One source line, without its terminator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Line<'a> {
        /// 0-based.
        pub number: usize,
        pub byte_offset: usize,
        /// Characters from the start of the document.
        pub offset: usize,
        pub content: &'a str,
    }

    impl<'a> Line<'a> {
        /// Length in characters.
        pub fn length(&self) -> usize {
            self.content.chars().count()
        }

        pub fn trimmed(&self) -> &'a str {
            self.content.trim()
        }

        pub fn is_empty(&self) -> bool {
            self.trimmed().is_empty()
        }

        pub fn has_prefix(&self, prefix: &str) -> bool {
            self.content.starts_with(prefix)
        }

        /// Document character offset of a byte index into `content`.
        pub fn offset_at(&self, byte_idx: usize) -> usize {
            self.offset + self.content[..byte_idx].chars().count()
        }

        pub fn coords(&self) -> DocCoords {
            DocCoords::new(self.number, self.offset, self.length())
        }
    }

    /// Split text into lines. A trailing line terminator does not open an extra line.
    pub fn split_lines(text: &str) -> Vec<Line<'_>> {
        let mut lines = Vec::new();
        let mut rest = text;
        let mut byte_offset = 0;
        let mut offset = 0;
        while !rest.is_empty() {
            let (raw, terminator, next) = match rest.find('\n') {
                Some(idx) => (&rest[..idx], 1, &rest[idx + 1..]),
                None => (rest, 0, ""),
            };
            lines.push(Line {
                number: lines.len(),
                byte_offset,
                offset,
                content: raw.strip_suffix('\r').unwrap_or(raw),
            });
            byte_offset += raw.len() + terminator;
            offset += raw.chars().count() + terminator;
            rest = next;
        }
        lines
    }

    /// Cursor over a materialized line array.
    #[derive(Debug, Clone)]
    pub struct LineScanner<'a> {
        lines: Vec<Line<'a>>,
        cursor: usize,
        can_unscan: bool,
        newline: Newline,
    }

    impl<'a> LineScanner<'a> {
        pub fn new(text: &'a str) -> Self {
            Self {
                lines: split_lines(text),
                cursor: 0,
                can_unscan: false,
                newline: Newline::detect(text),
            }
        }

        pub fn scan(&mut self) -> Option<Line<'a>> {
            let line = self.lines.get(self.cursor).copied();
            self.can_unscan = line.is_some();
            if line.is_some() {
                self.cursor += 1;
            }
            line
        }

        /// Push the last scanned line back. Only one line can be pushed back.
        pub fn unscan(&mut self) {
            if self.can_unscan {
                self.cursor -= 1;
                self.can_unscan = false;
            }
        }

        pub fn newline(&self) -> Newline {
            self.newline
        }

        pub fn lines(&self) -> &[Line<'a>] {
            &self.lines
        }

        pub fn into_lines(self) -> Vec<Line<'a>> {
            self.lines
        }
    }

}

pub mod parser {
    //! Line-oriented parser for task documents.
    //!
    //! Parsing strategy:
    //! - Blank lines are skipped at top level; a delimiter line opens a three-line
    //!   category block, a bracket line at column 0 opens a moment.
    //! - A moment line is taken apart from the right: identifier, then a
    //!   recurrence or date suffix, then the state mark (read with `nom`), then
    //!   priority marks. What is left is the name.
    //! - Lines indented one level deeper than a moment form its body: bracket lines
    //!   become children, everything else comments. The first shallower line is
    //!   pushed back and ends the body.
    //!
    //! Anything malformed inside a moment line stays in the name. Only broken
    //! category blocks fail the parse.

    use crate::config::ParseConfig;
    use crate::core::*;
    use crate::recurrence::epoch_week;
    use crate::scanner::{Line, LineScanner};
    use chrono::{Datelike, Days, Local, Months, NaiveDate, Weekday};
    use nom::{
        IResult,
        bytes::complete::{is_not, tag, take_till},
        character::complete::char,
        combinator::all_consuming,
        error::VerboseError,
        sequence::{delimited, tuple},
    };
    use tracing::debug;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse with the default configuration, anchoring recurrences to the local date.
    pub fn parse_str(input: &str) -> Result<Todos, ParseError> {
        let config = ParseConfig::default();
        Parser::new(&config).parse(input)
    }

    #[derive(Debug, Clone, Copy)]
    pub struct Parser<'c> {
        config: &'c ParseConfig,
        today: NaiveDate,
    }

    impl<'c> Parser<'c> {
        pub fn new(config: &'c ParseConfig) -> Self {
            Self {
                config,
                today: Local::now().date_naive(),
            }
        }

        /// Date that recurrence reference dates are computed from.
        pub fn with_today(mut self, today: NaiveDate) -> Self {
            self.today = today;
            self
        }

        pub fn config(&self) -> &'c ParseConfig {
            self.config
        }

        pub fn today(&self) -> NaiveDate {
            self.today
        }

        pub fn parse(&self, input: &str) -> Result<Todos, ParseError> {
            let mut state = ParseState {
                parser: *self,
                scanner: LineScanner::new(input),
                todos: Todos::default(),
                category: None,
            };
            while let Some(line) = state.scanner.scan() {
                state.handle_line(line)?;
            }
            debug!(
                moments = state.todos.moments.len(),
                categories = state.todos.categories.len(),
                ids = state.todos.ids.len(),
                "parsed document"
            );
            Ok(state.todos)
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* --------------------------- Document walk --------------------------- */

    struct ParseState<'c, 'a> {
        parser: Parser<'c>,
        scanner: LineScanner<'a>,
        todos: Todos,
        category: Option<CategoryRef>,
    }

    impl<'c, 'a> ParseState<'c, 'a> {
        fn settings(&self) -> &'c crate::config::Settings {
            self.parser.config.settings()
        }

        fn handle_line(&mut self, line: Line<'a>) -> Result<(), ParseError> {
            if line.is_empty() {
                return Ok(());
            }
            let settings = self.settings();
            if line.has_prefix(&settings.category_delim) {
                self.handle_category(line)
            } else if line.has_prefix(&settings.lbracket) {
                let path = vec![self.todos.moments.len()];
                let moment = self.parse_full_moment(line, LineView::whole(line).trim(), "", path);
                self.todos.moments.push(moment);
                Ok(())
            } else {
                Ok(())
            }
        }

        fn handle_category(&mut self, delim_line: Line<'a>) -> Result<(), ParseError> {
            let Some(name_line) = self.scanner.scan() else {
                return Err(ParseError::MissingCategoryName {
                    line: delim_line.number + 1,
                });
            };
            let category = parse_category(self.parser.config, name_line);

            match self.scanner.scan() {
                None => Err(ParseError::UnterminatedCategory {
                    line: name_line.number + 1,
                    category: category.name,
                }),
                Some(next) if !next.has_prefix(&self.settings().category_delim) => {
                    Err(ParseError::MismatchedDelimiter {
                        line: next.number + 1,
                        category: category.name,
                        found: next.content.to_string(),
                    })
                }
                Some(_) => {
                    let id = CategoryId(self.todos.categories.len());
                    self.category = Some(CategoryRef {
                        id: Some(id),
                        name: category.name.clone(),
                    });
                    self.todos.categories.push(category);
                    Ok(())
                }
            }
        }

        fn parse_full_moment(
            &mut self,
            line: Line<'a>,
            view: LineView<'a>,
            indent: &str,
            path: Vec<usize>,
        ) -> Moment {
            let mut moment = self.parser.parse_moment_line(line, view);
            moment.category = self.category.clone();
            if let Some(id) = &moment.id {
                self.todos.ids.insert(id.value.clone(), MomentPath(path.clone()));
            }
            self.parse_body(&mut moment, indent, &path);
            moment
        }

        fn parse_body(&mut self, moment: &mut Moment, indent: &str, path: &[usize]) {
            let next_indent = format!("{indent}{}", self.settings().indent);
            while let Some(line) = self.scanner.scan() {
                if line.has_prefix(&next_indent) {
                    let view = LineView::new(line, next_indent.len(), line.content.len());
                    if view.as_str().starts_with(&self.settings().lbracket) {
                        let mut child_path = path.to_vec();
                        child_path.push(moment.children.len());
                        let child =
                            self.parse_full_moment(line, view.trim_end(), &next_indent, child_path);
                        moment.children.push(child);
                    } else {
                        moment.comments.push(Comment {
                            content: view.as_str().to_string(),
                            coords: view.coords(),
                        });
                    }
                } else if line.is_empty() && !moment.comments.is_empty() {
                    // blank line between comments
                    moment.comments.push(Comment {
                        content: String::new(),
                        coords: DocCoords::new(line.number, line.offset, 0),
                    });
                } else {
                    self.scanner.unscan();
                    break;
                }
            }

            while moment.comments.last().is_some_and(|c| c.content.is_empty()) {
                moment.comments.pop();
            }
        }
    }

    /* ---------------------------- Line views ---------------------------- */

    /// Byte window into one line's content; keeps every extracted piece addressable.
    #[derive(Debug, Clone, Copy)]
    struct LineView<'a> {
        line: Line<'a>,
        start: usize,
        end: usize,
    }

    impl<'a> LineView<'a> {
        fn new(line: Line<'a>, start: usize, end: usize) -> Self {
            Self { line, start, end }
        }

        fn whole(line: Line<'a>) -> Self {
            Self::new(line, 0, line.content.len())
        }

        fn as_str(&self) -> &'a str {
            &self.line.content[self.start..self.end]
        }

        fn is_empty(&self) -> bool {
            self.start == self.end
        }

        fn trim(self) -> Self {
            let s = self.as_str();
            let start = self.start + (s.len() - s.trim_start().len());
            let end = (self.end - (s.len() - s.trim_end().len())).max(start);
            Self::new(self.line, start, end)
        }

        fn trim_end(self) -> Self {
            let s = self.as_str();
            Self::new(self.line, self.start, self.start + s.trim_end().len())
        }

        /// First `len` bytes.
        fn head(self, len: usize) -> Self {
            Self::new(self.line, self.start, self.start + len)
        }

        /// Everything from byte `from` on.
        fn tail(self, from: usize) -> Self {
            Self::new(self.line, self.start + from, self.end)
        }

        fn slice(self, from: usize, to: usize) -> Self {
            Self::new(self.line, self.start + from, self.start + to)
        }

        fn offset_at(&self, rel: usize) -> usize {
            self.line.offset_at(self.start + rel)
        }

        fn coords(&self) -> DocCoords {
            DocCoords::new(
                self.line.number,
                self.offset_at(0),
                self.as_str().chars().count(),
            )
        }
    }

    /* ---------------------------- Categories ---------------------------- */

    fn parse_category(config: &ParseConfig, line: Line<'_>) -> Category {
        let view = LineView::whole(line).trim();
        let (view, color) = split_color(config, view);
        let (view, priority) = split_priority(config, view);
        Category {
            name: view.as_str().to_string(),
            priority,
            color,
            coords: line.coords(),
        }
    }

    /// Trailing `[color]` annotation on a category name line.
    fn split_color<'a>(config: &ParseConfig, view: LineView<'a>) -> (LineView<'a>, Option<String>) {
        let settings = config.settings();
        let s = view.as_str();
        let Some(open) = s.rfind(settings.lbracket.as_str()) else {
            return (view, None);
        };
        let closing = settings.rbracket.to_string();
        let annotation = delimited(
            tag::<_, _, VerboseError<&str>>(settings.lbracket.as_str()),
            is_not(closing.as_str()),
            char(settings.rbracket),
        );
        match all_consuming(annotation)(&s[open..]) {
            Ok((_, color)) if !color.trim().is_empty() => {
                (view.head(open).trim(), Some(color.trim().to_string()))
            }
            _ => (view, None),
        }
    }

    fn split_priority<'a>(config: &ParseConfig, view: LineView<'a>) -> (LineView<'a>, u32) {
        let s = view.as_str();
        let stripped = s.trim_end_matches(config.settings().priority_mark);
        let count = s[stripped.len()..].chars().count() as u32;
        (view.head(stripped.len()).trim(), count)
    }

    /* ----------------------------- Moment lines ----------------------------- */

    impl<'c> Parser<'c> {
        fn parse_moment_line<'a>(&self, line: Line<'a>, view: LineView<'a>) -> Moment {
            let (view, id) = parse_identifier(view);
            let (view, schedule, time_of_day) = match self.parse_recurrence(view) {
                Some((rest, recurrence, time_of_day)) => {
                    (rest, Schedule::Recurring { recurrence }, time_of_day)
                }
                None => self.parse_dates(view),
            };
            let (view, state) = self.parse_state(view);
            let (view, priority) = split_priority(self.config, view);

            Moment {
                name: view.as_str().to_string(),
                state,
                priority,
                category: None,
                id,
                time_of_day,
                schedule,
                comments: Vec::new(),
                children: Vec::new(),
                coords: line.coords(),
            }
        }

        fn parse_recurrence<'a>(
            &self,
            view: LineView<'a>,
        ) -> Option<(LineView<'a>, Recurrence, Option<TimeOfDay>)> {
            let (rest, inner) = split_paren_suffix(view)?;
            let (inner, time_of_day) = self.parse_time_suffix(inner);
            let (kind, reference) = self.match_recurrence(inner.as_str())?;
            let recurrence = Recurrence {
                kind,
                reference: Date {
                    time: start_of_day(reference),
                    coords: inner.coords(),
                },
            };
            Some((rest, recurrence, time_of_day))
        }

        fn parse_dates<'a>(
            &self,
            view: LineView<'a>,
        ) -> (LineView<'a>, Schedule, Option<TimeOfDay>) {
            let unbounded = Schedule::Single {
                start: None,
                end: None,
            };
            let Some((rest, inner)) = split_paren_suffix(view) else {
                return (view, unbounded, None);
            };
            let (inner, time_of_day) = self.parse_time_suffix(inner);
            match self.parse_date_range(inner) {
                Some((start, end)) => (rest, Schedule::Single { start, end }, time_of_day),
                None => (view, unbounded, None),
            }
        }

        /// A lone date, or `start-end` with either side blank. Each `-` is tried as the
        /// separator from left to right so date formats may contain dashes.
        fn parse_date_range(&self, inner: LineView<'_>) -> Option<(Option<Date>, Option<Date>)> {
            let inner = inner.trim();
            if let Some(day) = self.config.parse_date(inner.as_str()) {
                let coords = inner.coords();
                return Some((
                    Some(Date {
                        time: start_of_day(day),
                        coords,
                    }),
                    Some(Date {
                        time: end_of_day(day),
                        coords,
                    }),
                ));
            }

            for (idx, _) in inner.as_str().match_indices('-') {
                let left = inner.head(idx).trim();
                let right = inner.tail(idx + 1).trim();
                if left.is_empty() && right.is_empty() {
                    continue;
                }
                let Some(start) = self.parse_bound(left, start_of_day) else {
                    continue;
                };
                let Some(end) = self.parse_bound(right, end_of_day) else {
                    continue;
                };
                return Some((start, end));
            }
            None
        }

        /// `Some(None)` for a blank side, `None` when the side does not parse.
        fn parse_bound(
            &self,
            view: LineView<'_>,
            at: fn(NaiveDate) -> chrono::NaiveDateTime,
        ) -> Option<Option<Date>> {
            if view.is_empty() {
                return Some(None);
            }
            let day = self.config.parse_date(view.as_str())?;
            Some(Some(Date {
                time: at(day),
                coords: view.coords(),
            }))
        }

        /// Split a trailing ` HH:MM` token off the parenthesized text.
        fn parse_time_suffix<'a>(&self, inner: LineView<'a>) -> (LineView<'a>, Option<TimeOfDay>) {
            let inner = inner.trim();
            let Some(space) = inner.as_str().rfind([' ', '\t']) else {
                return (inner, None);
            };
            let token = inner.tail(space + 1);
            match self.config.parse_time(token.as_str()) {
                Some(time) => (
                    inner.head(space).trim(),
                    Some(TimeOfDay {
                        time,
                        coords: token.coords(),
                    }),
                ),
                None => (inner, None),
            }
        }

        /// Patterns in priority order: daily, weekly, nth-weekly, monthly, yearly.
        fn match_recurrence(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            self.match_daily(text)
                .or_else(|| self.match_weekly(text))
                .or_else(|| self.match_nth_weekly(text))
                .or_else(|| self.match_monthly(text))
                .or_else(|| self.match_yearly(text))
        }

        fn match_daily(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            self.config
                .daily_pattern()
                .is_match(text)
                .then_some((RecurrenceKind::Daily, self.today))
        }

        fn match_weekly(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            let caps = self.config.weekly_pattern().captures(text)?;
            let day = self.config.weekday(caps.get(1)?.as_str())?;
            Some((RecurrenceKind::Weekly, weekday_in_week(self.today, day)?))
        }

        /// The anchor is the weekday in the current week, moved back to the first week
        /// of its N-week block so it stays put while the block lasts.
        fn match_nth_weekly(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            let caps = self.config.nth_weekly_pattern().captures(text)?;
            let weeks = self.config.nth(caps.get(1)?.as_str())?;
            let day = self.config.weekday(caps.get(2)?.as_str())?;
            let kind = RecurrenceKind::from_week_interval(weeks)?;
            let date = weekday_in_week(self.today, day)?;
            let shift = epoch_week(date).rem_euclid(i64::from(weeks)) as u64;
            Some((kind, date.checked_sub_days(Days::new(7 * shift))?))
        }

        fn match_monthly(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            let caps = self.config.monthly_pattern().captures(text)?;
            let day: u32 = caps.get(1)?.as_str().parse().ok()?;
            let first = self.today.with_day(1)?;
            let anchor = (0..12).find_map(|ahead| {
                first
                    .checked_add_months(Months::new(ahead))
                    .and_then(|month| month.with_day(day))
            })?;
            Some((RecurrenceKind::Monthly, anchor))
        }

        fn match_yearly(&self, text: &str) -> Option<(RecurrenceKind, NaiveDate)> {
            let caps = self.config.yearly_pattern().captures(text)?;
            let day: u32 = caps.get(1)?.as_str().parse().ok()?;
            let month: u32 = caps.get(2)?.as_str().parse().ok()?;
            let year = self.today.year();
            let anchor =
                (year..year + 8).find_map(|y| NaiveDate::from_ymd_opt(y, month, day))?;
            Some((RecurrenceKind::Yearly, anchor))
        }

        /// `[x] rest`: the single non-blank character inside the brackets picks the
        /// state. Anything else leaves the line untouched and the moment `New`.
        fn parse_state<'a>(&self, view: LineView<'a>) -> (LineView<'a>, WorkState) {
            let settings = self.config.settings();
            let s = view.as_str();
            let Ok((rest, mark)) = state_mark(&settings.lbracket, settings.rbracket, s) else {
                return (view, WorkState::New);
            };
            let mut chars = mark.trim().chars();
            let state = match (chars.next(), chars.next()) {
                (None, _) => WorkState::New,
                (Some(c), None) => self.state_for(c),
                (Some(_), Some(_)) => return (view, WorkState::New),
            };
            (view.tail(s.len() - rest.len()).trim(), state)
        }

        fn state_for(&self, mark: char) -> WorkState {
            let settings = self.config.settings();
            let matches = |configured: char| configured.to_lowercase().eq(mark.to_lowercase());
            if matches(settings.done_mark) {
                WorkState::Done
            } else if matches(settings.in_progress_mark) {
                WorkState::InProgress
            } else if matches(settings.waiting_mark) {
                WorkState::Waiting
            } else {
                WorkState::New
            }
        }
    }

    fn state_mark<'i>(lbracket: &str, rbracket: char, i: &'i str) -> PResult<'i, &'i str> {
        let (i, (_, mark, _)) = tuple((
            tag(lbracket),
            take_till(move |c| c == rbracket),
            char(rbracket),
        ))(i)?;
        Ok((i, mark))
    }

    /// Rightmost ` #id`; the coordinates start at the `#`.
    fn parse_identifier(view: LineView<'_>) -> (LineView<'_>, Option<Identifier>) {
        let s = view.as_str();
        let Some(pos) = s.rfind(" #") else {
            return (view, None);
        };
        let value = s[pos + 2..].trim();
        if value.is_empty() {
            return (view, None);
        }
        let coords = DocCoords::new(
            view.line.number,
            view.offset_at(pos + 1),
            value.chars().count() + 1,
        );
        let id = Identifier {
            value: value.to_string(),
            coords,
        };
        (view.head(pos).trim(), Some(id))
    }

    /// `text (inner)` at the end of the view: returns the text before `(` and the
    /// untrimmed inner part.
    fn split_paren_suffix(view: LineView<'_>) -> Option<(LineView<'_>, LineView<'_>)> {
        let s = view.as_str();
        let body = s.strip_suffix(')')?;
        let open = body.rfind('(')?;
        Some((view.head(open).trim(), view.slice(open + 1, body.len())))
    }

    /// Same-week date for `day`, weeks running Sunday to Saturday.
    fn weekday_in_week(today: NaiveDate, day: Weekday) -> Option<NaiveDate> {
        let week_start =
            today.checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_sunday())))?;
        week_start.checked_add_days(Days::new(u64::from(day.num_days_from_sunday())))
    }

}

pub mod recurrence {
    //! Lazy expansion of recurrence rules into occurrence days.
    //!
    //! All arithmetic is on calendar dates, so "already passed" checks never trip
    //! over daylight-saving shifts. Occurrences are reported at the start of day.

    use crate::core::{Recurrence, RecurrenceKind, start_of_day};
    use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, Weekday};

    /// `num_days_from_ce` of Monday 1969-12-29, the start of week 0.
    const EPOCH_MONDAY_CE_DAYS: i64 = 719_160;

    /// Monday-based week counter, used to phase-lock N-weekly rules to their anchor.
    pub fn epoch_week(date: NaiveDate) -> i64 {
        (i64::from(date.num_days_from_ce()) - EPOCH_MONDAY_CE_DAYS).div_euclid(7)
    }

    /// Occurrences of a rule inside the inclusive window `[from, until]`.
    #[derive(Debug, Clone)]
    pub struct RecurIterator {
        kind: RecurrenceKind,
        reference: NaiveDate,
        until: NaiveDate,
        next: Option<NaiveDate>,
    }

    impl RecurIterator {
        pub fn new(recurrence: &Recurrence, from: NaiveDateTime, until: NaiveDateTime) -> Self {
            let mut iter = Self {
                kind: recurrence.kind,
                reference: recurrence.reference.time.date(),
                until: until.date(),
                next: None,
            };
            iter.next = from.date().pred_opt().and_then(|before| iter.advance(before));
            iter
        }

        pub fn has_next(&self) -> bool {
            self.next.is_some_and(|next| next <= self.until)
        }

        /// First occurrence strictly after `after`.
        fn advance(&self, after: NaiveDate) -> Option<NaiveDate> {
            match self.kind {
                RecurrenceKind::Daily => after.succ_opt(),
                RecurrenceKind::Weekly => next_weekday(after, self.reference.weekday()),
                RecurrenceKind::BiWeekly
                | RecurrenceKind::TriWeekly
                | RecurrenceKind::QuadriWeekly => {
                    let weeks = i64::from(self.kind.week_interval()?);
                    let phase = epoch_week(self.reference).rem_euclid(weeks);
                    let mut candidate = next_weekday(after, self.reference.weekday())?;
                    while epoch_week(candidate).rem_euclid(weeks) != phase {
                        candidate = candidate.checked_add_days(Days::new(7))?;
                    }
                    Some(candidate)
                }
                RecurrenceKind::Monthly => next_monthly(after, self.reference.day()),
                RecurrenceKind::Yearly => {
                    next_yearly(after, self.reference.month(), self.reference.day())
                }
            }
        }
    }

    impl Iterator for RecurIterator {
        type Item = NaiveDateTime;

        fn next(&mut self) -> Option<Self::Item> {
            let current = self.next.filter(|next| *next <= self.until)?;
            self.next = self.advance(current);
            Some(start_of_day(current))
        }
    }

    fn next_weekday(after: NaiveDate, day: Weekday) -> Option<NaiveDate> {
        let diff = (7 + day.num_days_from_sunday() - after.weekday().num_days_from_sunday()) % 7;
        let ahead = if diff == 0 { 7 } else { diff };
        after.checked_add_days(Days::new(u64::from(ahead)))
    }

    /// Months without the reference day are skipped.
    fn next_monthly(after: NaiveDate, day: u32) -> Option<NaiveDate> {
        let first = after.with_day(1)?;
        (0..=12).find_map(|ahead| {
            first
                .checked_add_months(Months::new(ahead))
                .and_then(|month| month.with_day(day))
                .filter(|candidate| *candidate > after)
        })
    }

    /// Years without the reference day (29.02) are skipped.
    fn next_yearly(after: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
        let year = after.year();
        (year..=year + 8).find_map(|y| {
            NaiveDate::from_ymd_opt(y, month, day).filter(|candidate| *candidate > after)
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn day(d: u32, m: u32, y: i32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn occurrences(kind: RecurrenceKind, anchor: NaiveDate, from: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
            let rule = Recurrence::new(kind, anchor);
            RecurIterator::new(&rule, start_of_day(from), start_of_day(until))
                .map(|at| at.date())
                .collect()
        }

        #[test]
        fn epoch_week_starts_on_monday() {
            assert_eq!(epoch_week(day(29, 12, 1969)), 0);
            assert_eq!(epoch_week(day(4, 1, 1970)), 0);
            assert_eq!(epoch_week(day(5, 1, 1970)), 1);
            assert_eq!(epoch_week(day(28, 12, 1969)), -1);
        }

        #[test]
        fn daily_includes_both_window_ends() {
            assert_eq!(
                occurrences(RecurrenceKind::Daily, day(1, 1, 2019), day(10, 1, 2019), day(13, 1, 2019)),
                vec![day(10, 1, 2019), day(11, 1, 2019), day(12, 1, 2019), day(13, 1, 2019)]
            );
        }

        #[test]
        fn weekly_rolls_past_the_current_day() {
            assert_eq!(
                occurrences(RecurrenceKind::Weekly, day(2, 1, 2019), day(10, 1, 2019), day(31, 1, 2019)),
                vec![day(16, 1, 2019), day(23, 1, 2019), day(30, 1, 2019)]
            );
            assert_eq!(
                occurrences(RecurrenceKind::Weekly, day(2, 1, 2019), day(16, 1, 2019), day(16, 1, 2019)),
                vec![day(16, 1, 2019)]
            );
        }

        #[test]
        fn biweekly_is_phase_locked_to_the_anchor() {
            let anchor = day(2, 11, 2019);
            assert_eq!(
                occurrences(RecurrenceKind::BiWeekly, anchor, day(5, 11, 2019), day(31, 12, 2019)),
                vec![day(16, 11, 2019), day(30, 11, 2019), day(14, 12, 2019), day(28, 12, 2019)]
            );
            assert_eq!(
                occurrences(RecurrenceKind::BiWeekly, anchor, day(1, 11, 2019), day(31, 12, 2019)),
                vec![
                    day(2, 11, 2019),
                    day(16, 11, 2019),
                    day(30, 11, 2019),
                    day(14, 12, 2019),
                    day(28, 12, 2019)
                ]
            );
            assert_eq!(
                occurrences(RecurrenceKind::BiWeekly, anchor, day(1, 10, 2019), day(30, 11, 2019)),
                vec![
                    day(5, 10, 2019),
                    day(19, 10, 2019),
                    day(2, 11, 2019),
                    day(16, 11, 2019),
                    day(30, 11, 2019)
                ]
            );
            assert!(
                occurrences(RecurrenceKind::BiWeekly, anchor, day(3, 11, 2019), day(15, 11, 2019)).is_empty()
            );
        }

        #[test]
        fn triweekly_skips_two_weeks() {
            assert_eq!(
                occurrences(RecurrenceKind::TriWeekly, day(2, 11, 2019), day(5, 11, 2019), day(31, 12, 2019)),
                vec![day(23, 11, 2019), day(14, 12, 2019)]
            );
        }

        #[test]
        fn monthly_and_yearly_roll_forward() {
            assert_eq!(
                occurrences(RecurrenceKind::Monthly, day(2, 1, 2019), day(10, 1, 2019), day(30, 4, 2019)),
                vec![day(2, 2, 2019), day(2, 3, 2019), day(2, 4, 2019)]
            );
            assert_eq!(
                occurrences(RecurrenceKind::Yearly, day(2, 1, 2019), day(10, 1, 2019), day(30, 4, 2022)),
                vec![day(2, 1, 2020), day(2, 1, 2021), day(2, 1, 2022)]
            );
        }

        #[test]
        fn monthly_skips_months_without_the_day() {
            assert_eq!(
                occurrences(RecurrenceKind::Monthly, day(31, 1, 2019), day(1, 1, 2019), day(31, 5, 2019)),
                vec![day(31, 1, 2019), day(31, 3, 2019), day(31, 5, 2019)]
            );
            assert_eq!(
                occurrences(RecurrenceKind::Yearly, day(29, 2, 2020), day(1, 1, 2021), day(31, 12, 2024)),
                vec![day(29, 2, 2024)]
            );
        }

        #[test]
        fn has_next_tracks_the_window() {
            let rule = Recurrence::new(RecurrenceKind::Daily, day(1, 1, 2019));
            let mut iter = RecurIterator::new(&rule, start_of_day(day(1, 1, 2019)), start_of_day(day(2, 1, 2019)));
            assert!(iter.has_next());
            assert_eq!(iter.next().map(|at| at.date()), Some(day(1, 1, 2019)));
            assert!(iter.has_next());
            iter.next();
            assert!(!iter.has_next());
            assert!(iter.next().is_none());

            let empty = RecurIterator::new(&rule, start_of_day(day(5, 1, 2019)), start_of_day(day(2, 1, 2019)));
            assert!(!empty.has_next());
        }
    }
}

pub mod instances {
    //! Concrete calendar occurrences of moments inside a query window.

    use crate::core::*;
    use crate::recurrence::RecurIterator;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// One occurrence of a moment. Generated per query, never stored.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Instance {
        pub name: String,
        pub start: NaiveDateTime,
        pub end: NaiveDateTime,
        /// Start day combined with the moment's time of day.
        pub time_of_day: Option<NaiveDateTime>,
        pub priority: u32,
        pub category: Option<CategoryRef>,
        pub state: WorkState,
        pub done: bool,
        /// The moment's real end fits inside the window instead of being cut off by it.
        pub ends_in_range: bool,
        #[serde(default)]
        pub sub_instances: Vec<Instance>,
    }

    pub fn generate(moment: &Moment, from: NaiveDateTime, to: NaiveDateTime) -> Vec<Instance> {
        generate_filtered(moment, from, to, true, |_| true)
    }

    pub fn generate_without_subs(
        moment: &Moment,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Vec<Instance> {
        generate_filtered(moment, from, to, false, |_| true)
    }

    /// Instances failing `filter` are dropped before their children are looked at.
    pub fn generate_filtered<F>(
        moment: &Moment,
        from: NaiveDateTime,
        to: NaiveDateTime,
        include_subs: bool,
        filter: F,
    ) -> Vec<Instance>
    where
        F: Fn(&Instance) -> bool,
    {
        expand(moment, from, to, include_subs, &filter)
    }

    /// Instances of every top-level moment, in document order.
    pub fn generate_for_todos<F>(
        todos: &Todos,
        from: NaiveDateTime,
        to: NaiveDateTime,
        include_subs: bool,
        filter: F,
    ) -> Vec<Instance>
    where
        F: Fn(&Instance) -> bool,
    {
        let instances: Vec<_> = todos
            .moments
            .iter()
            .flat_map(|moment| expand(moment, from, to, include_subs, &filter))
            .collect();
        debug!(%from, %to, count = instances.len(), "generated instances");
        instances
    }

    fn expand(
        moment: &Moment,
        from: NaiveDateTime,
        to: NaiveDateTime,
        include_subs: bool,
        filter: &dyn Fn(&Instance) -> bool,
    ) -> Vec<Instance> {
        let mut instances: Vec<Instance> = match &moment.schedule {
            Schedule::Single { start, end } => {
                single_instance(moment, start.as_ref(), end.as_ref(), from, to)
                    .into_iter()
                    .collect()
            }
            Schedule::Recurring { recurrence } => RecurIterator::new(recurrence, from, to)
                .map(|at| recurring_instance(moment, at))
                .collect(),
        };
        instances.retain(|instance| filter(instance));

        if include_subs {
            for instance in &mut instances {
                instance.sub_instances = moment
                    .children
                    .iter()
                    .flat_map(|child| expand(child, instance.start, instance.end, true, filter))
                    .collect();
            }
        }
        instances
    }

    fn single_instance(
        moment: &Moment,
        start: Option<&Date>,
        end: Option<&Date>,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Option<Instance> {
        let clipped_start = start.map_or(from, |d| d.time.max(from));
        let clipped_end = end.map_or(to, |d| d.time.min(to));
        if clipped_end < clipped_start {
            return None;
        }
        let ends_in_range = end.is_some_and(|d| d.time <= clipped_end);
        Some(instance(moment, clipped_start, clipped_end, ends_in_range))
    }

    fn recurring_instance(moment: &Moment, at: NaiveDateTime) -> Instance {
        instance(moment, at, end_of_day(at.date()), true)
    }

    fn instance(
        moment: &Moment,
        start: NaiveDateTime,
        end: NaiveDateTime,
        ends_in_range: bool,
    ) -> Instance {
        Instance {
            name: moment.name.clone(),
            start,
            end,
            time_of_day: moment
                .time_of_day
                .map(|tod| start.date().and_time(tod.time)),
            priority: moment.priority,
            category: moment.category.clone(),
            state: moment.state,
            done: moment.is_done(),
            ends_in_range,
            sub_instances: Vec::new(),
        }
    }

}

pub mod format {
    use crate::config::ParseConfig;
    use crate::core::*;
    use chrono::Datelike;

    pub fn format_moment(config: &ParseConfig, moment: &Moment) -> String {
        format_moment_at_depth(config, moment, 0)
    }

    /// Render a moment subtree, its declaration line indented `depth` levels.
    pub fn format_moment_at_depth(config: &ParseConfig, moment: &Moment, depth: usize) -> String {
        let mut out = String::new();
        write_moment(&mut out, config, moment, depth);
        out
    }

    pub fn format_moments(config: &ParseConfig, moments: &[Moment]) -> String {
        moments
            .iter()
            .map(|moment| format_moment(config, moment))
            .collect()
    }

    /// Canonical rendering of a whole document: uncategorized moments first, then
    /// each category block followed by its moments.
    pub fn format_todos(config: &ParseConfig, todos: &Todos) -> String {
        let mut out = String::new();
        for moment in todos.moments.iter().filter(|m| category_index(todos, m).is_none()) {
            write_moment(&mut out, config, moment, 0);
        }

        for (idx, category) in todos.categories.iter().enumerate() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format_category(config, category));
            for moment in todos
                .moments
                .iter()
                .filter(|m| category_index(todos, m) == Some(idx))
            {
                write_moment(&mut out, config, moment, 0);
            }
        }
        out
    }

    pub fn format_category(config: &ParseConfig, category: &Category) -> String {
        let settings = config.settings();
        let mut name = format!(" {}", category.name);
        push_marks(&mut name, settings.priority_mark, category.priority);
        if let Some(color) = &category.color {
            name.push_str(&format!(" {}{}{}", settings.lbracket, color, settings.rbracket));
        }
        format!(
            "{delim}\n{name}\n{delim}\n",
            delim = settings.category_delim
        )
    }

    /// The declaration line without indentation or line break.
    pub fn render_moment_line(config: &ParseConfig, moment: &Moment) -> String {
        let settings = config.settings();
        let mark = match moment.state {
            WorkState::New => String::new(),
            WorkState::Done => settings.done_mark.to_string(),
            WorkState::InProgress => settings.in_progress_mark.to_string(),
            WorkState::Waiting => settings.waiting_mark.to_string(),
        };
        let mut line = format!("{}{}{} {}", settings.lbracket, mark, settings.rbracket, moment.name);
        push_marks(&mut line, settings.priority_mark, moment.priority);
        if let Some(mut schedule) = render_schedule(config, moment) {
            if let Some(tod) = &moment.time_of_day {
                schedule.push(' ');
                schedule.push_str(&config.format_time(tod.time));
            }
            line.push_str(&format!(" ({schedule})"));
        }
        if let Some(id) = &moment.id {
            line.push_str(&format!(" #{}", id.value));
        }
        line
    }

    fn write_moment(out: &mut String, config: &ParseConfig, moment: &Moment, depth: usize) {
        let indent = config.settings().indent.repeat(depth);
        let inner = config.settings().indent.repeat(depth + 1);

        out.push_str(&indent);
        out.push_str(&render_moment_line(config, moment));
        out.push('\n');
        for comment in &moment.comments {
            if !comment.content.is_empty() {
                out.push_str(&inner);
                out.push_str(&comment.content);
            }
            out.push('\n');
        }
        for child in &moment.children {
            write_moment(out, config, child, depth + 1);
        }
    }

    fn render_schedule(config: &ParseConfig, moment: &Moment) -> Option<String> {
        match &moment.schedule {
            Schedule::Single { start, end } => {
                let start = start.map(|d| d.time.date());
                let end = end.map(|d| d.time.date());
                match (start, end) {
                    (Some(s), Some(e)) if s == e => Some(config.format_date(s)),
                    (Some(s), Some(e)) => {
                        Some(format!("{}-{}", config.format_date(s), config.format_date(e)))
                    }
                    (Some(s), None) => Some(format!("{}-", config.format_date(s))),
                    (None, Some(e)) => Some(format!("-{}", config.format_date(e))),
                    (None, None) => None,
                }
            }
            Schedule::Recurring { recurrence } => Some(render_recurrence(config, recurrence)),
        }
    }

    fn render_recurrence(config: &ParseConfig, recurrence: &Recurrence) -> String {
        let reference = recurrence.reference.time.date();
        match recurrence.kind {
            RecurrenceKind::Daily => "every day".to_string(),
            RecurrenceKind::Weekly => format!("every {}", config.weekday_name(reference.weekday())),
            RecurrenceKind::BiWeekly | RecurrenceKind::TriWeekly | RecurrenceKind::QuadriWeekly => {
                let weeks = recurrence.kind.week_interval().unwrap_or(1);
                let nth = config
                    .nth_name(weeks)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{weeks}th"));
                format!("every {} {}", nth, config.weekday_name(reference.weekday()))
            }
            RecurrenceKind::Monthly => format!("every {}.", reference.day()),
            RecurrenceKind::Yearly => format!("every {}.{}.", reference.day(), reference.month()),
        }
    }

    fn push_marks(out: &mut String, mark: char, count: u32) {
        out.extend(std::iter::repeat_n(mark, count as usize));
    }

    fn category_index(todos: &Todos, moment: &Moment) -> Option<usize> {
        let reference = moment.category.as_ref()?;
        reference
            .id
            .map(|id| id.0)
            .or_else(|| todos.categories.iter().position(|c| c.name == reference.name))
    }

}

pub mod modify {
    //! Structural edits applied to raw text by line ranges.
    //!
    //! Lines outside the touched ranges are copied verbatim; only inserted or
    //! replaced moments go through the serializer.

    use crate::config::ParseConfig;
    use crate::core::*;
    use crate::format::{format_moment, format_moment_at_depth};
    use crate::parser::Parser;
    use crate::scanner::LineScanner;
    use chrono::NaiveDateTime;
    use indexmap::IndexMap;
    use std::collections::{BTreeMap, HashSet};
    use std::ops::RangeInclusive;
    use tracing::debug;

    const TRASH_RULE: &str = "------------------";

    #[derive(Debug, thiserror::Error)]
    pub enum ModifyError {
        #[error("moment '{0}' doesn't have an identifier")]
        MissingIdentifier(String),
        #[error("duplicate moment identifier '{0}'")]
        DuplicateIdentifier(String),
        #[error("content is missing necessary categories to insert moments: {}", .0.join(", "))]
        MissingCategories(Vec<String>),
        #[error(transparent)]
        Parse(#[from] ParseError),
    }

    /// Text split into the lines that stayed and the lines that were taken out.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Partition {
        pub kept: String,
        pub deleted: String,
    }

    /// Where inserted moments land inside their category.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Placement {
        Top,
        Bottom,
    }

    /* ------------------------------ Delete ------------------------------ */

    /// Remove the full line ranges of `moments`, which must come from parsing `text`.
    /// Blank lines right after a removed line go with it.
    pub fn delete(text: &str, moments: &[&Moment]) -> Partition {
        let ranges = moments.iter().map(|m| m.line_range()).collect();
        partition_lines(text, ranges, true)
    }

    fn partition_lines(
        text: &str,
        mut ranges: Vec<RangeInclusive<usize>>,
        swallow_blank: bool,
    ) -> Partition {
        ranges.sort_by_key(|range| *range.start());
        let scanner = LineScanner::new(text);
        let newline = scanner.newline().as_str();

        let mut kept = Vec::new();
        let mut deleted = Vec::new();
        let mut previous_deleted = false;
        for line in scanner.into_lines() {
            let in_range = ranges.iter().any(|range| range.contains(&line.number));
            if in_range || (swallow_blank && previous_deleted && line.is_empty()) {
                deleted.push(line.content);
                previous_deleted = true;
            } else {
                kept.push(line.content);
                previous_deleted = false;
            }
        }
        debug!(kept = kept.len(), deleted = deleted.len(), "partitioned lines");

        Partition {
            kept: kept.join(newline),
            deleted: deleted.join(newline),
        }
    }

    /* ------------------------------ Insert ------------------------------ */

    pub fn append(config: &ParseConfig, text: &str, moments: &[Moment]) -> Result<String, ModifyError> {
        insert(config, text, moments, Placement::Bottom)
    }

    pub fn prepend(config: &ParseConfig, text: &str, moments: &[Moment]) -> Result<String, ModifyError> {
        insert(config, text, moments, Placement::Top)
    }

    /// Splice serialized moments into the category named by each moment. Every
    /// named category must already exist; uncategorized moments go to the part
    /// before the first category, or to the document start when that part has none.
    pub fn insert(
        config: &ParseConfig,
        text: &str,
        moments: &[Moment],
        placement: Placement,
    ) -> Result<String, ModifyError> {
        let todos = Parser::new(config).parse(text)?;
        let (uncategorized, by_category) = group_by_category(moments);
        let bounds = CategoryBounds::find(&todos);

        let missing: Vec<String> = by_category
            .keys()
            .filter(|name| bounds.category(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ModifyError::MissingCategories(missing));
        }

        // Line after which each block goes; `None` is the document start.
        let mut splices: BTreeMap<Option<usize>, String> = BTreeMap::new();
        if !uncategorized.is_empty() {
            let at = bounds.uncategorized.pick(placement);
            splices
                .entry(at)
                .or_default()
                .push_str(&render(config, &uncategorized));
        }
        for (name, group) in &by_category {
            if let Some(bound) = bounds.category(name) {
                splices
                    .entry(bound.pick(placement))
                    .or_default()
                    .push_str(&render(config, group));
            }
        }
        debug!(count = moments.len(), ?placement, "inserting moments");

        Ok(splice(text, &splices))
    }

    fn group_by_category(moments: &[Moment]) -> (Vec<&Moment>, IndexMap<&str, Vec<&Moment>>) {
        let mut uncategorized = Vec::new();
        let mut by_category: IndexMap<&str, Vec<&Moment>> = IndexMap::new();
        for moment in moments {
            match &moment.category {
                Some(category) => by_category.entry(category.name.as_str()).or_default().push(moment),
                None => uncategorized.push(moment),
            }
        }
        (uncategorized, by_category)
    }

    fn render(config: &ParseConfig, moments: &[&Moment]) -> String {
        moments.iter().map(|m| format_moment(config, m)).collect()
    }

    /// Copy `text` line by line, emitting each splice after its anchor line.
    fn splice(text: &str, splices: &BTreeMap<Option<usize>, String>) -> String {
        let scanner = LineScanner::new(text);
        let newline = scanner.newline().as_str();
        let mut out = String::new();
        if let Some(block) = splices.get(&None) {
            push_block(&mut out, block, newline);
        }
        for line in scanner.into_lines() {
            out.push_str(line.content);
            out.push_str(newline);
            if let Some(block) = splices.get(&Some(line.number)) {
                push_block(&mut out, block, newline);
            }
        }
        keep_final_terminator(out, text, newline)
    }

    /// A document without a final line break keeps lacking one after an edit.
    fn keep_final_terminator(mut out: String, text: &str, newline: &str) -> String {
        if !text.is_empty() && !text.ends_with('\n') && out.ends_with(newline) {
            out.truncate(out.len() - newline.len());
        }
        out
    }

    /// Serialized blocks use `\n`; convert when the document uses another terminator.
    fn push_block(out: &mut String, block: &str, newline: &str) {
        if newline == "\n" {
            out.push_str(block);
        } else {
            out.push_str(&block.replace('\n', newline));
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Bound {
        top: Option<usize>,
        bottom: Option<usize>,
    }

    impl Bound {
        fn pick(self, placement: Placement) -> Option<usize> {
            match placement {
                Placement::Top => self.top,
                Placement::Bottom => self.bottom,
            }
        }
    }

    struct CategoryBounds<'t> {
        uncategorized: Bound,
        categories: Vec<(&'t str, Bound)>,
    }

    impl<'t> CategoryBounds<'t> {
        /// Top of a category is its closing delimiter line, bottom the last line of
        /// its last moment (or the top when it is empty). The uncategorized part
        /// always starts at the document start.
        fn find(todos: &'t Todos) -> Self {
            let mut categories: Vec<(&str, Bound)> = todos
                .categories
                .iter()
                .map(|c| {
                    let top = Some(c.coords.line_number + 1);
                    (c.name.as_str(), Bound { top, bottom: top })
                })
                .collect();
            let mut uncategorized = Bound {
                top: None,
                bottom: None,
            };

            for moment in &todos.moments {
                let bottom = Some(moment.bottom_line_number());
                match moment.category.as_ref().and_then(|c| c.id) {
                    Some(id) => {
                        if let Some((_, bound)) = categories.get_mut(id.0) {
                            bound.bottom = bottom;
                        }
                    }
                    None => uncategorized.bottom = bottom,
                }
            }
            Self {
                uncategorized,
                categories,
            }
        }

        /// First category with that name.
        fn category(&self, name: &str) -> Option<Bound> {
            self.categories
                .iter()
                .find(|(candidate, _)| *candidate == name)
                .map(|(_, bound)| *bound)
        }
    }

    /* ------------------------------ Upsert ------------------------------ */

    /// Replace moments whose identifier already exists in `text`, insert the rest.
    ///
    /// Every input needs an identifier and identifiers must be unique. Only the first
    /// moment carrying an identifier in document order is replaced. A replacement
    /// keeps the nesting depth of the moment it replaces. An input matching a moment
    /// nested inside another replaced moment is dropped with that subtree.
    pub fn upsert(
        config: &ParseConfig,
        text: &str,
        moments: &[Moment],
        placement: Placement,
    ) -> Result<String, ModifyError> {
        let mut wanted: IndexMap<&str, &Moment> = IndexMap::new();
        for moment in moments {
            let id = moment
                .id_value()
                .ok_or_else(|| ModifyError::MissingIdentifier(moment.name.clone()))?;
            if wanted.insert(id, moment).is_some() {
                return Err(ModifyError::DuplicateIdentifier(id.to_string()));
            }
        }

        let todos = Parser::new(config).parse(text)?;
        let mut replacements = Vec::new();
        let mut consumed = HashSet::new();
        let mut covered_until: Option<usize> = None;
        for (depth, existing) in todos.walk() {
            let line = existing.coords.line_number;
            let inside_replaced = covered_until.is_some_and(|bottom| line <= bottom);
            let Some(id) = existing.id_value() else {
                continue;
            };
            if consumed.contains(id) {
                continue;
            }
            let Some(new) = wanted.get(id) else {
                continue;
            };
            consumed.insert(id);
            if inside_replaced {
                continue;
            }
            covered_until = Some(existing.bottom_line_number());
            replacements.push((existing.line_range(), format_moment_at_depth(config, new, depth)));
        }

        let replaced = if replacements.is_empty() {
            text.to_string()
        } else {
            replace_ranges(text, &replacements)
        };
        debug!(replaced = replacements.len(), "upserted moments");

        let remaining: Vec<Moment> = wanted
            .into_iter()
            .filter(|(id, _)| !consumed.contains(id))
            .map(|(_, moment)| moment.clone())
            .collect();
        if remaining.is_empty() {
            Ok(replaced)
        } else {
            insert(config, &replaced, &remaining, placement)
        }
    }

    fn replace_ranges(text: &str, replacements: &[(RangeInclusive<usize>, String)]) -> String {
        let scanner = LineScanner::new(text);
        let newline = scanner.newline().as_str();
        let mut out = String::new();
        for line in scanner.into_lines() {
            match replacements.iter().find(|(range, _)| range.contains(&line.number)) {
                Some((range, block)) => {
                    if *range.end() == line.number {
                        push_block(&mut out, block, newline);
                    }
                }
                None => {
                    out.push_str(line.content);
                    out.push_str(newline);
                }
            }
        }
        keep_final_terminator(out, text, newline)
    }

    /* ------------------------------ Cleanup ------------------------------ */

    /// Move done moments out of `text`. With `only_top_level` unset, done moments
    /// nested under open parents move as well.
    pub fn separate_done(
        config: &ParseConfig,
        text: &str,
        only_top_level: bool,
    ) -> Result<Partition, ParseError> {
        let todos = Parser::new(config).parse(text)?;
        let mut ranges = Vec::new();
        collect_done(&todos.moments, only_top_level, &mut ranges);
        Ok(partition_lines(text, ranges, false))
    }

    fn collect_done(moments: &[Moment], only_top_level: bool, out: &mut Vec<RangeInclusive<usize>>) {
        for moment in moments {
            if moment.is_done() {
                out.push(moment.line_range());
            } else if !only_top_level {
                collect_done(&moment.children, only_top_level, out);
            }
        }
    }

    /// Done moments appended after the remaining content.
    pub fn move_done_to_end(
        config: &ParseConfig,
        text: &str,
        only_top_level: bool,
    ) -> Result<String, ParseError> {
        let newline = LineScanner::new(text).newline().as_str();
        let Partition { kept, deleted } = separate_done(config, text, only_top_level)?;
        Ok(join_blocks(&[&kept, &deleted], newline))
    }

    /// Kept text and the trash text extended by a dated section holding the done moments.
    pub fn move_done_to_trash(
        config: &ParseConfig,
        text: &str,
        trash: &str,
        only_top_level: bool,
        now: NaiveDateTime,
    ) -> Result<Partition, ParseError> {
        let newline = LineScanner::new(text).newline().as_str();
        let Partition { kept, deleted } = separate_done(config, text, only_top_level)?;
        if deleted.is_empty() {
            return Ok(Partition {
                kept: join_blocks(&[&kept], newline),
                deleted: trash.to_string(),
            });
        }
        let header = [
            String::new(),
            TRASH_RULE.to_string(),
            format!("  Trash from {}", now.format("%d.%m.%Y %H:%M:%S")),
            TRASH_RULE.to_string(),
        ]
        .join(newline);
        let mut updated = trash.to_string();
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push_str(newline);
        }
        updated.push_str(&join_blocks(&[&header, &deleted], newline));
        Ok(Partition {
            kept: join_blocks(&[&kept], newline),
            deleted: updated,
        })
    }

    /// Non-empty blocks, each terminated by a line break.
    fn join_blocks(blocks: &[&str], newline: &str) -> String {
        blocks
            .iter()
            .filter(|block| !block.is_empty())
            .map(|block| format!("{block}{newline}"))
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        const INPUT: &str = "[] hello

---------------
 cat 1
---------------
[] foo
[x] bar
\tsome commet
\t[] bar1
\t[] bar2
---------------
 cat 2
---------------

[] zonk
";

        const DONE_INPUT: &str = "
[] foo
[x] bar
\tsome commet
\t[] bar1
\t[] bar2
[] gib
\t[x] ja
[x] haba
\tcomments1
\tcomments2
\tcomments3
[] yo";

        const NEW_BLOCK: &str = "[] a new thing 1
\tmy comment
\thaha
[] a new thing 2
\t[x] a new sub thing 2.1
";

        fn new_moments(category: Option<&str>) -> Vec<Moment> {
            let first = Moment::new("a new thing 1")
                .with_comment("my comment")
                .with_comment("haha");
            let second = Moment::new("a new thing 2")
                .with_child(Moment::new("a new sub thing 2.1").with_state(WorkState::Done));
            match category {
                Some(name) => vec![first.with_category(name), second.with_category(name)],
                None => vec![first, second],
            }
        }

        fn parse(text: &str) -> Todos {
            Parser::new(&ParseConfig::default()).parse(text).expect("parse")
        }

        #[test]
        fn delete_routes_full_ranges_and_trailing_blank_lines() {
            let todos = parse(INPUT);
            let bar = &todos.moments[2];
            assert_eq!(bar.name, "bar");

            let Partition { kept, deleted } = delete(INPUT, &[bar]);
            assert_eq!(deleted, "[x] bar\n\tsome commet\n\t[] bar1\n\t[] bar2");
            assert!(kept.starts_with("[] hello\n\n---------------\n cat 1\n---------------\n[] foo\n---------------"));
            assert!(kept.ends_with("[] zonk"));

            let hello = &todos.moments[0];
            let Partition { kept, deleted } = delete(INPUT, &[hello]);
            assert_eq!(deleted, "[] hello\n");
            assert!(kept.starts_with("---------------\n cat 1"));
        }

        #[test]
        fn delete_accepts_ranges_in_any_order() {
            let todos = parse(INPUT);
            let zonk = &todos.moments[3];
            let foo = &todos.moments[1];
            let Partition { deleted, .. } = delete(INPUT, &[zonk, foo]);
            assert_eq!(deleted, "[] foo\n[] zonk");
        }

        #[test]
        fn delete_then_insert_restores_the_document() {
            let todos = parse(INPUT);
            let bar = todos.moments[2].clone();
            let Partition { kept, .. } = delete(INPUT, &[&bar]);
            let restored = append(&ParseConfig::default(), &kept, &[bar]).expect("append");
            assert_eq!(format!("{restored}\n"), INPUT);
        }

        #[test]
        fn append_without_category_follows_the_leading_moments() {
            let out = append(&ParseConfig::default(), INPUT, &new_moments(None)).expect("append");
            let expected = format!("[] hello\n{NEW_BLOCK}{}", &INPUT["[] hello\n".len()..]);
            assert_eq!(out, expected);
        }

        #[test]
        fn prepend_without_category_goes_to_the_document_start() {
            let out = prepend(&ParseConfig::default(), INPUT, &new_moments(None)).expect("prepend");
            assert_eq!(out, format!("{NEW_BLOCK}{INPUT}"));
        }

        #[test]
        fn append_and_prepend_into_a_category() {
            let config = ParseConfig::default();
            let appended = append(&config, INPUT, &new_moments(Some("cat 1"))).expect("append");
            assert!(appended.contains(&format!("\t[] bar2\n{NEW_BLOCK}---------------\n cat 2")));

            let prepended = prepend(&config, INPUT, &new_moments(Some("cat 1"))).expect("prepend");
            assert!(prepended.contains(&format!(" cat 1\n---------------\n{NEW_BLOCK}[] foo")));

            let last = append(&config, INPUT, &new_moments(Some("cat 2"))).expect("append");
            assert_eq!(last, format!("{INPUT}{NEW_BLOCK}"));
        }

        #[test]
        fn insert_into_empty_category_and_empty_leading_part() {
            let input = "------\n empty\n------\n------\n full\n------\n[] x\n";
            let mut moments = vec![Moment::new("first").with_category("empty")];
            moments.push(Moment::new("loose"));
            let out = append(&ParseConfig::default(), input, &moments).expect("append");
            assert_eq!(
                out,
                "[] loose\n------\n empty\n------\n[] first\n------\n full\n------\n[] x\n"
            );
        }

        #[test]
        fn insert_requires_existing_categories() {
            let moments = vec![Moment::new("x").with_category("nonexistent cat")];
            let err = append(&ParseConfig::default(), INPUT, &moments).expect_err("missing category");
            match &err {
                ModifyError::MissingCategories(names) => assert_eq!(names, &vec!["nonexistent cat".to_string()]),
                other => panic!("expected missing categories, got {:?}", other),
            }
            assert_eq!(
                err.to_string(),
                "content is missing necessary categories to insert moments: nonexistent cat"
            );
        }

        #[test]
        fn insert_surfaces_parse_errors() {
            let err = append(&ParseConfig::default(), "------\n broken", &[Moment::new("x")])
                .expect_err("broken category");
            assert!(matches!(err, ModifyError::Parse(ParseError::UnterminatedCategory { .. })));
        }

        #[test]
        fn upsert_validates_identifiers() {
            let config = ParseConfig::default();
            let err = upsert(&config, INPUT, &[Moment::new("no id")], Placement::Bottom)
                .expect_err("missing id");
            assert!(matches!(&err, ModifyError::MissingIdentifier(name) if name == "no id"));
            assert_eq!(err.to_string(), "moment 'no id' doesn't have an identifier");

            let twice = [Moment::new("a").with_id("same"), Moment::new("b").with_id("same")];
            let err = upsert(&config, INPUT, &twice, Placement::Bottom).expect_err("duplicate id");
            assert!(matches!(&err, ModifyError::DuplicateIdentifier(id) if id == "same"));
        }

        #[test]
        fn upsert_replaces_in_place_and_inserts_the_rest() {
            let text = "[] one #a\n\tcomment\n\n[] two #b\n";
            let moments = [
                Moment::new("three").with_id("c"),
                Moment::new("one updated").with_id("a"),
            ];
            let out = upsert(&ParseConfig::default(), text, &moments, Placement::Bottom).expect("upsert");
            assert_eq!(out, "[] one updated #a\n\n[] two #b\n[] three #c\n");
        }

        #[test]
        fn upsert_keeps_the_depth_of_nested_moments() {
            let text = "[] parent\n\t[] child #c\n\t\tnote\n[] other";
            let moments = [Moment::new("child v2").with_id("c").with_state(WorkState::Done)];
            let out = upsert(&ParseConfig::default(), text, &moments, Placement::Top).expect("upsert");
            assert_eq!(out, "[] parent\n\t[x] child v2 #c\n[] other");
        }

        #[test]
        fn upsert_replaces_only_the_first_moment_with_a_shared_id() {
            let text = "[] first #x\n[] middle\n[] second #x\n";
            let out = upsert(
                &ParseConfig::default(),
                text,
                &[Moment::new("new").with_id("x")],
                Placement::Bottom,
            )
            .expect("upsert");
            assert_eq!(out, "[] new #x\n[] middle\n[] second #x\n");
            assert_eq!(out.matches("[] new #x").count(), 1);
        }

        #[test]
        fn edits_keep_a_missing_final_line_break() {
            let config = ParseConfig::default();
            let text = "[] a #a\n[] b";

            let replaced = upsert(&config, text, &[Moment::new("a2").with_id("a")], Placement::Bottom)
                .expect("upsert");
            assert_eq!(replaced, "[] a2 #a\n[] b");

            let appended = append(&config, text, &[Moment::new("c")]).expect("append");
            assert_eq!(appended, "[] a #a\n[] b\n[] c");

            let prepended = prepend(&config, text, &[Moment::new("c")]).expect("prepend");
            assert_eq!(prepended, "[] c\n[] a #a\n[] b");

            let last = upsert(&config, "[] a\r\n[] b #b", &[Moment::new("b2").with_id("b")], Placement::Top)
                .expect("upsert");
            assert_eq!(last, "[] a\r\n[] b2 #b");
        }

        #[test]
        fn upsert_drops_inputs_inside_a_replaced_subtree() {
            let text = "[] parent #p\n\t[] child #c\n";
            let moments = [
                Moment::new("parent v2").with_id("p"),
                Moment::new("child v2").with_id("c"),
            ];
            let out = upsert(&ParseConfig::default(), text, &moments, Placement::Bottom).expect("upsert");
            assert_eq!(out, "[] parent v2 #p\n");
        }

        #[test]
        fn edits_keep_crlf_line_breaks() {
            let text = "[] a #a\r\n\tnote\r\n[] b\r\n";
            let out = upsert(
                &ParseConfig::default(),
                text,
                &[Moment::new("a2").with_id("a").with_comment("new note")],
                Placement::Bottom,
            )
            .expect("upsert");
            assert_eq!(out, "[] a2 #a\r\n\tnew note\r\n[] b\r\n");

            let todos = parse(text);
            let Partition { kept, deleted } = delete(text, &[&todos.moments[0]]);
            assert_eq!(kept, "[] b");
            assert_eq!(deleted, "[] a #a\r\n\tnote");
        }

        #[test]
        fn separate_done_top_level_only() {
            let Partition { kept, deleted } =
                separate_done(&ParseConfig::default(), DONE_INPUT, true).expect("separate");
            assert_eq!(kept, "\n[] foo\n[] gib\n\t[x] ja\n[] yo");
            assert_eq!(
                deleted,
                "[x] bar\n\tsome commet\n\t[] bar1\n\t[] bar2\n[x] haba\n\tcomments1\n\tcomments2\n\tcomments3"
            );
        }

        #[test]
        fn separate_done_all_levels() {
            let Partition { kept, deleted } =
                separate_done(&ParseConfig::default(), DONE_INPUT, false).expect("separate");
            assert_eq!(kept, "\n[] foo\n[] gib\n[] yo");
            assert_eq!(
                deleted,
                "[x] bar\n\tsome commet\n\t[] bar1\n\t[] bar2\n\t[x] ja\n[x] haba\n\tcomments1\n\tcomments2\n\tcomments3"
            );
        }

        #[test]
        fn done_moments_move_to_the_end() {
            let out = move_done_to_end(&ParseConfig::default(), DONE_INPUT, true).expect("move");
            assert_eq!(
                out,
                "\n[] foo\n[] gib\n\t[x] ja\n[] yo\n[x] bar\n\tsome commet\n\t[] bar1\n\t[] bar2\n[x] haba\n\tcomments1\n\tcomments2\n\tcomments3\n"
            );
        }

        #[test]
        fn done_moments_move_to_a_dated_trash_section() {
            let now = NaiveDate::from_ymd_opt(2019, 1, 13)
                .and_then(|d| d.and_hms_opt(12, 2, 42))
                .expect("timestamp");
            let Partition { kept, deleted } =
                move_done_to_trash(&ParseConfig::default(), DONE_INPUT, "", true, now).expect("trash");
            assert_eq!(kept, "\n[] foo\n[] gib\n\t[x] ja\n[] yo\n");
            assert_eq!(
                deleted,
                "\n------------------\n  Trash from 13.01.2019 12:02:42\n------------------\n[x] bar\n\tsome commet\n\t[] bar1\n\t[] bar2\n[x] haba\n\tcomments1\n\tcomments2\n\tcomments3\n"
            );

            let Partition { kept, deleted } =
                move_done_to_trash(&ParseConfig::default(), "[] open", "old", true, now).expect("trash");
            assert_eq!(kept, "[] open\n");
            assert_eq!(deleted, "old");
        }
    }
}

pub use config::{ParseConfig, Settings};
pub use format::{format_moment, format_todos};
pub use instances::{Instance, generate, generate_filtered, generate_for_todos};
pub use modify::{ModifyError, Partition, Placement, append, delete, prepend, upsert};
pub use parser::{Parser, parse_str};
