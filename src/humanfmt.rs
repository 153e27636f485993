use std::time::Duration;

const SIZE_UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

#[must_use]
pub(crate) enum HumanFmt {
    Size(u64),
    Rate(u64, Duration),
    Time(Duration),
}

#[inline]
#[must_use]
const fn precision(value: f64) -> usize {
    if value > 100.0 {
        0
    } else if value > 10.0 {
        1
    } else {
        2
    }
}

fn fmt_scaled(f: &mut std::fmt::Formatter<'_>, value: f64, suffix: &str) -> std::fmt::Result {
    let mut value = value;
    for unit in &SIZE_UNITS[..SIZE_UNITS.len() - 1] {
        if value < 1000.0 {
            return f.write_fmt(format_args!("{value:.0$}{unit}{suffix}", precision(value)));
        }
        value /= 1000.0;
    }
    let unit = SIZE_UNITS[SIZE_UNITS.len() - 1];
    f.write_fmt(format_args!("{value:.0$}{unit}{suffix}", precision(value)))
}

impl std::fmt::Display for HumanFmt {
    #[expect(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Size(bytes) => {
                if bytes < 1000 {
                    return f.write_fmt(format_args!("{bytes}B"));
                }
                fmt_scaled(f, bytes as f64, "")
            }
            Self::Rate(bytes, time) => {
                let secs = time.as_secs_f64();
                if secs == 0.0 {
                    return f.write_str("???B/s");
                }
                fmt_scaled(f, bytes as f64 / secs, "/s")
            }
            Self::Time(time) => {
                let nanos = time.as_nanos();
                if nanos < 1000 {
                    return f.write_fmt(format_args!("{nanos}ns"));
                }
                let mut value = nanos as f64 / 1000.0;
                for unit in ["us", "ms"] {
                    if value < 1000.0 {
                        return f.write_fmt(format_args!("{value:.0$}{unit}", precision(value)));
                    }
                    value /= 1000.0;
                }
                if value < 600.0 {
                    return f.write_fmt(format_args!("{value:.0$}s", precision(value)));
                }

                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let mut rest = value as u64;
                let secs = rest % 60;
                rest /= 60;
                let mins = rest % 60;
                rest /= 60;
                let hours = rest % 24;
                let days = rest / 24;

                for (amount, unit) in [(days, "d"), (hours, "h"), (mins, "m"), (secs, "s")] {
                    if amount != 0 {
                        f.write_fmt(format_args!("{amount}{unit}"))?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::humanfmt::HumanFmt;

    #[test]
    fn size_test() {
        assert_eq!(format!("{}", HumanFmt::Size(0)), "0B");
        assert_eq!(format!("{}", HumanFmt::Size(999)), "999B");
        assert_eq!(format!("{}", HumanFmt::Size(1024)), "1.02kB");
        assert_eq!(format!("{}", HumanFmt::Size(24756)), "24.8kB");
        assert_eq!(format!("{}", HumanFmt::Size(247_569_325_892)), "248GB");
        assert_eq!(format!("{}", HumanFmt::Size(u64::MAX)), "18446744TB");
    }

    #[test]
    fn rate_test() {
        assert_eq!(
            format!("{}", HumanFmt::Rate(1000, Duration::from_millis(0))),
            "???B/s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Rate(0, Duration::from_millis(1000))),
            "0.00B/s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Rate(1000, Duration::from_millis(1000))),
            "1.00kB/s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Rate(30_000_000, Duration::from_secs(10))),
            "3.00MB/s"
        );
    }

    #[test]
    fn time_test() {
        assert_eq!(format!("{}", HumanFmt::Time(Duration::from_nanos(0))), "0ns");
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_nanos(900))),
            "900ns"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_nanos(1024))),
            "1.02us"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_millis(250))),
            "250ms"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(248))),
            "248s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(601))),
            "10m1s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(86401))),
            "1d1s"
        );
        assert_eq!(
            format!("{}", HumanFmt::Time(Duration::from_secs(1441 * 60))),
            "1d1m"
        );
    }
}
