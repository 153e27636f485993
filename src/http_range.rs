use std::cmp::min;
use std::time::SystemTime;

use time::format_description::FormatItem;
use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::warn_once_or_info;

const HTTP_DATE_FORMAT: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[must_use]
pub(crate) fn systemtime_to_http_datetime(time: SystemTime) -> String {
    let odt = OffsetDateTime::from(time);

    /* round up to the next full second */
    let odt = match odt.nanosecond() {
        0 => odt,
        ns => odt.saturating_add(Duration::NANOSECOND * (1_000_000_000 - ns)),
    };

    odt.format(HTTP_DATE_FORMAT).expect("date should be valid")
}

#[must_use]
pub(crate) fn http_datetime_to_systemtime(time: &str) -> Option<SystemTime> {
    OffsetDateTime::parse(time, &Rfc2822)
        .ok()
        .map(std::convert::Into::into)
}

/// A validated single byte-range against a file of known size.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ByteRange {
    /// Value for the `Content-Range` response header.
    pub(crate) content_range: String,
    /// First byte to serve.
    pub(crate) start: u64,
    /// Number of bytes to serve.
    pub(crate) length: u64,
}

/// Resolves a `Range`/`If-Range` header pair (RFC 7233 section 2.1) against
/// the file size. `None` means the whole file is served with a plain 200:
/// no range requested, the range is unsatisfiable, or the `If-Range`
/// precondition failed. Multi-range requests are not supported and fall
/// back to the full file.
#[must_use]
pub(crate) fn resolve_byte_range(
    range: Option<&str>,
    if_range: Option<&str>,
    file_size: u64,
    modification_time: SystemTime,
) -> Option<ByteRange> {
    if file_size == 0 {
        return None;
    }

    let byte_range = range?.strip_prefix("bytes=")?;
    if byte_range.contains(',') {
        warn_once_or_info!("HTTP range requests with multiple ranges are not supported (`{byte_range}`)");
        return None;
    }

    let (start, end) = byte_range.split_once('-')?;

    let start = if start.is_empty() {
        None
    } else {
        Some(start.parse::<u64>().ok()?)
    };
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };

    let (start, end) = match (start, end) {
        (None, None) => return None,
        (Some(s), Some(e)) => {
            if s > e || s >= file_size {
                return None;
            }
            (s, min(e, file_size - 1))
        }
        (Some(s), None) => {
            if s >= file_size {
                return None;
            }
            (s, file_size - 1)
        }
        (None, Some(e)) => {
            if e == 0 {
                return None;
            }
            (file_size.saturating_sub(e), file_size - 1)
        }
    };

    if let Some(if_range) = if_range {
        let if_time = http_datetime_to_systemtime(if_range)?;

        if if_time < modification_time {
            return None;
        }
    }

    Some(ByteRange {
        content_range: format!("bytes {start}-{end}/{file_size}"),
        start,
        length: end + 1 - start,
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn range(spec: (&str, u64, u64)) -> Option<ByteRange> {
        Some(ByteRange {
            content_range: spec.0.to_string(),
            start: spec.1,
            length: spec.2,
        })
    }

    #[test]
    fn datetime_round_trip() {
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
        assert_eq!(
            http_datetime_to_systemtime("Thu, 01 Jan 1970 00:00:00 GMT"),
            Some(UNIX_EPOCH)
        );

        /* sub-second timestamps round up */
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH + Duration::from_nanos(1)),
            "Thu, 01 Jan 1970 00:00:01 GMT"
        );
    }

    #[test]
    fn satisfiable_ranges() {
        assert_eq!(
            resolve_byte_range(Some("bytes=0-1023"), None, 8192, UNIX_EPOCH),
            range(("bytes 0-1023/8192", 0, 1024))
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=5000-6999"), None, 10000, UNIX_EPOCH),
            range(("bytes 5000-6999/10000", 5000, 2000))
        );

        /* end clamped to the file size */
        assert_eq!(
            resolve_byte_range(Some("bytes=5000-6999"), None, 6000, UNIX_EPOCH),
            range(("bytes 5000-5999/6000", 5000, 1000))
        );

        /* open-ended and suffix forms */
        assert_eq!(
            resolve_byte_range(Some("bytes=4096-"), None, 10000, UNIX_EPOCH),
            range(("bytes 4096-9999/10000", 4096, 5904))
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=-500"), None, 10000, UNIX_EPOCH),
            range(("bytes 9500-9999/10000", 9500, 500))
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=-1000"), None, 400, UNIX_EPOCH),
            range(("bytes 0-399/400", 0, 400))
        );
    }

    #[test]
    fn if_range_gates_on_modification_time() {
        assert_eq!(
            resolve_byte_range(
                Some("bytes=0-1023"),
                Some("Tue, 21 Mar 2361 19:15:09 GMT"),
                8192,
                UNIX_EPOCH
            ),
            range(("bytes 0-1023/8192", 0, 1024))
        );

        /* file changed after the validator: serve the whole file */
        assert_eq!(
            resolve_byte_range(
                Some("bytes=0-1023"),
                Some("Thu, 01 Jan 1970 00:00:00 GMT"),
                8192,
                UNIX_EPOCH + Duration::from_secs(60)
            ),
            None
        );

        /* unparsable validator */
        assert_eq!(
            resolve_byte_range(Some("bytes=0-1023"), Some("ABCDEFG"), 8192, UNIX_EPOCH),
            None
        );
    }

    #[test]
    fn unsatisfiable_ranges_serve_the_full_file() {
        assert_eq!(resolve_byte_range(None, None, 8192, UNIX_EPOCH), None);
        assert_eq!(
            resolve_byte_range(Some("bytes=0-1023"), None, 0, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=9999-99999"), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=1023-0"), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=foo-bar"), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes="), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=-"), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=-0"), None, 8192, UNIX_EPOCH),
            None
        );
        assert_eq!(
            resolve_byte_range(Some("bytes=0-50, 100-150"), None, 8192, UNIX_EPOCH),
            None
        );
    }
}
