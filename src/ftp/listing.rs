use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};

/// Server path flavor; drives path joining and the listing-parser hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStyle {
    Unix,
    Windows,
    Vms,
    Mvs,
    IbmZvm,
    Tandem,
}

impl PathStyle {
    /// Join a directory path and a name the way the server spells paths.
    /// Only Unix/Windows join with a separator character; record-oriented
    /// styles concatenate according to their own syntax.
    pub fn join(&self, path: &str, name: &str) -> String {
        match self {
            PathStyle::Unix => {
                format!("{}/{}", path.trim_end_matches('/'), name)
            }
            PathStyle::Windows => {
                format!("{}\\{}", path.trim_end_matches('\\'), name)
            }
            PathStyle::Vms => format!("{}{}", path, name),
            PathStyle::Mvs | PathStyle::IbmZvm => format!("{}.{}", path.trim_end_matches('.'), name),
            PathStyle::Tandem => format!("{}.{}", path.trim_end_matches('.'), name),
        }
    }

    /// Guess the style from a SYST answer; Unix is the safe default.
    pub fn from_system_hint(hint: Option<&str>) -> PathStyle {
        let Some(hint) = hint else {
            return PathStyle::Unix;
        };
        let upper = hint.to_ascii_uppercase();
        if upper.contains("VMS") {
            PathStyle::Vms
        } else if upper.contains("WINDOWS") || upper.contains("WIN32") {
            PathStyle::Windows
        } else if upper.contains("MVS") || upper.contains("OS/390") || upper.contains("Z/OS") {
            PathStyle::Mvs
        } else if upper.contains("VM/") || upper.contains("Z/VM") {
            PathStyle::IbmZvm
        } else if upper.contains("TANDEM") || upper.contains("NONSTOP") {
            PathStyle::Tandem
        } else {
            PathStyle::Unix
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingEntryKind {
    File,
    Directory,
    Link,
}

/// Size as reported by the listing. Some servers report blocks, some report
/// nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeInfo {
    Bytes(u64),
    Blocks(u64),
    Unknown,
}

impl SizeInfo {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            SizeInfo::Bytes(b) => Some(*b),
            _ => None,
        }
    }
}

/// One parsed listing entry.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub kind: ListingEntryKind,
    pub size: SizeInfo,
    /// Raw rights column when the format has one ("rwxr-xr-x").
    pub rights: Option<String>,
    pub date_time: Option<NaiveDateTime>,
    pub is_hidden: bool,
    /// Link target when the listing spells it out ("name -> target").
    pub link_target: Option<String>,
}

/// Why a listing could not be parsed.
#[derive(Debug, Clone)]
pub enum ListingParseError {
    /// No parser understands this format.
    UnknownFormat,
    /// The data stopped mid-record (transfer was cut short).
    Truncated,
}

impl std::fmt::Display for ListingParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListingParseError::UnknownFormat => f.write_str("unknown listing format"),
            ListingParseError::Truncated => f.write_str("listing data is truncated"),
        }
    }
}

impl std::error::Error for ListingParseError {}

/// The listing-parser seam. The engine never interprets raw listing bytes
/// itself; the host supplies this primitive (the crate ships a plain Unix
/// `ls -l` implementation as the default).
pub trait ParseListing: Send + Sync {
    fn parse_listing(
        &self,
        bytes: &[u8],
        server_hint: Option<&str>,
        style: PathStyle,
    ) -> Result<Vec<ListingEntry>, ListingParseError>;
}

/// Parser for the common `ls -l` output shape:
/// `-rw-r--r--  1 owner group  1234 Jan  5 12:30 name`.
pub struct UnixListingParser {
    /// Year assumed for "Mon DD HH:MM" entries (listings omit the year for
    /// recent files). Defaults to the current year.
    reference_year: i32,
}

impl Default for UnixListingParser {
    fn default() -> Self {
        UnixListingParser { reference_year: Utc::now().year() }
    }
}

impl UnixListingParser {
    pub fn with_reference_year(reference_year: i32) -> Self {
        UnixListingParser { reference_year }
    }

    fn parse_line(&self, line: &str) -> Option<ListingEntry> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            return None;
        }
        let mut fields = line.split_whitespace();
        let mode = fields.next()?;
        if mode.len() < 10 {
            return None;
        }
        let kind = match mode.as_bytes()[0] {
            b'd' => ListingEntryKind::Directory,
            b'l' => ListingEntryKind::Link,
            b'-' => ListingEntryKind::File,
            _ => return None,
        };
        let _links = fields.next()?;
        let _owner = fields.next()?;
        let _group = fields.next()?;
        let size_field = fields.next()?;
        let month = fields.next()?;
        let day = fields.next()?;
        let year_or_time = fields.next()?;

        // The name is everything after the time column, preserving inner
        // whitespace; split_whitespace cannot give that back, so re-find it.
        let name_start = find_field_end(line, 8)?;
        let raw_name = line[name_start..].trim_start();
        if raw_name.is_empty() || raw_name == "." || raw_name == ".." {
            return None;
        }
        let (name, link_target) = match raw_name.split_once(" -> ") {
            Some((n, t)) if kind == ListingEntryKind::Link => {
                (n.to_string(), Some(t.to_string()))
            }
            _ => (raw_name.to_string(), None),
        };

        let size = match size_field.parse::<u64>() {
            Ok(b) if kind == ListingEntryKind::File => SizeInfo::Bytes(b),
            Ok(_) => SizeInfo::Unknown,
            Err(_) => SizeInfo::Unknown,
        };
        let date_time = parse_unix_date(month, day, year_or_time, self.reference_year);
        let is_hidden = name.starts_with('.');
        Some(ListingEntry {
            name,
            kind,
            size,
            rights: Some(mode[1..].to_string()),
            date_time,
            is_hidden,
            link_target,
        })
    }
}

/// Byte offset just past the n-th whitespace-separated field.
fn find_field_end(line: &str, n: usize) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut idx = 0;
    let mut field = 0;
    while field < n {
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= bytes.len() {
            return None;
        }
        while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        field += 1;
    }
    Some(idx)
}

fn parse_unix_date(
    month: &str,
    day: &str,
    year_or_time: &str,
    reference_year: i32,
) -> Option<NaiveDateTime> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let month_idx = MONTHS.iter().position(|m| month.eq_ignore_ascii_case(m))? as u32 + 1;
    let day: u32 = day.parse().ok()?;
    if let Some((h, m)) = year_or_time.split_once(':') {
        let hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        NaiveDate::from_ymd_opt(reference_year, month_idx, day)?.and_hms_opt(hour, minute, 0)
    } else {
        let year: i32 = year_or_time.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month_idx, day)?.and_hms_opt(0, 0, 0)
    }
}

impl ParseListing for UnixListingParser {
    fn parse_listing(
        &self,
        bytes: &[u8],
        _server_hint: Option<&str>,
        _style: PathStyle,
    ) -> Result<Vec<ListingEntry>, ListingParseError> {
        let text = String::from_utf8_lossy(bytes);
        let mut entries = Vec::new();
        let mut understood_any = false;
        for line in text.lines() {
            if line.trim().is_empty() || line.starts_with("total ") {
                understood_any = true;
                continue;
            }
            match self.parse_line(line) {
                Some(entry) => {
                    understood_any = true;
                    entries.push(entry);
                }
                None => {
                    // One unreadable line poisons the whole listing; a wrong
                    // partial view is worse than no view.
                    return Err(ListingParseError::UnknownFormat);
                }
            }
        }
        if !understood_any && !text.trim().is_empty() {
            return Err(ListingParseError::UnknownFormat);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "total 12\r\n\
drwxr-xr-x   2 joe  staff     4096 Jan  5 12:30 sub\r\n\
-rw-r--r--   1 joe  staff     1000 Mar 14  2024 report.txt\r\n\
lrwxrwxrwx   1 joe  staff       11 Jan  5 12:31 latest -> report.txt\r\n\
-rw-------   1 joe  staff       42 Jan  6 08:00 .secret\r\n";

    fn parse() -> Vec<ListingEntry> {
        UnixListingParser::with_reference_year(2026)
            .parse_listing(SAMPLE.as_bytes(), Some("UNIX Type: L8"), PathStyle::Unix)
            .unwrap()
    }

    #[test]
    fn parses_kinds_sizes_and_hidden_flags() {
        let entries = parse();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].kind, ListingEntryKind::Directory);
        assert_eq!(entries[1].kind, ListingEntryKind::File);
        assert_eq!(entries[1].size, SizeInfo::Bytes(1000));
        assert_eq!(entries[2].kind, ListingEntryKind::Link);
        assert_eq!(entries[2].link_target.as_deref(), Some("report.txt"));
        assert!(entries[3].is_hidden);
    }

    #[test]
    fn year_and_time_forms_both_parse() {
        let entries = parse();
        let with_time = entries[0].date_time.unwrap();
        assert_eq!(with_time.date().year(), 2026);
        let with_year = entries[1].date_time.unwrap();
        assert_eq!(with_year.date().year(), 2024);
    }

    #[test]
    fn rights_column_is_preserved() {
        let entries = parse();
        assert_eq!(entries[1].rights.as_deref(), Some("rw-r--r--"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let parser = UnixListingParser::default();
        let err = parser
            .parse_listing(b"<html>not a listing</html>", None, PathStyle::Unix)
            .unwrap_err();
        assert!(matches!(err, ListingParseError::UnknownFormat));
    }

    #[test]
    fn names_with_spaces_survive() {
        let raw = "-rw-r--r--   1 joe  staff  10 Jan  5 12:30 with space.txt\r\n";
        let entries = UnixListingParser::with_reference_year(2026)
            .parse_listing(raw.as_bytes(), None, PathStyle::Unix)
            .unwrap();
        assert_eq!(entries[0].name, "with space.txt");
    }

    #[test]
    fn style_join_rules() {
        assert_eq!(PathStyle::Unix.join("/data/", "x"), "/data/x");
        assert_eq!(PathStyle::Windows.join("C:\\data", "x"), "C:\\data\\x");
        assert_eq!(PathStyle::Mvs.join("USER.QUAL", "SET"), "USER.QUAL.SET");
    }

    #[test]
    fn system_hint_guesses() {
        assert_eq!(PathStyle::from_system_hint(Some("UNIX Type: L8")), PathStyle::Unix);
        assert_eq!(PathStyle::from_system_hint(Some("VMS V5.5")), PathStyle::Vms);
        assert_eq!(PathStyle::from_system_hint(Some("MVS is great")), PathStyle::Mvs);
        assert_eq!(PathStyle::from_system_hint(None), PathStyle::Unix);
    }
}
