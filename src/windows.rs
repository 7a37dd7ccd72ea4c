use crate::error::{EngineError, EngineResult};
use crate::models::Window;
use chrono::{Months, NaiveDate};

fn add_years(date: NaiveDate, years: u32) -> Option<NaiveDate> {
    date.checked_add_months(Months::new(years.checked_mul(12)?))
}

/// Rolling windows of `length_years`, advancing one year at a time.
///
/// A window is emitted while its full length fits before `end` (one day of
/// tolerance). If that leaves days uncovered, one shorter tail window
/// `[next_start, end]` closes the gap. Ids follow start order.
pub fn generate_windows(
    start: NaiveDate,
    end: NaiveDate,
    length_years: u32,
) -> EngineResult<Vec<Window>> {
    if length_years == 0 {
        return Err(EngineError::invalid("window length must be at least one year"));
    }
    if end <= start {
        return Err(EngineError::invalid(format!(
            "window range end {} must be after start {}",
            end, start
        )));
    }
    let tolerance_end = end.succ_opt().unwrap_or(end);

    let mut windows = Vec::new();
    let mut current_start = start;
    while let Some(full_end) = add_years(current_start, length_years) {
        if full_end > tolerance_end {
            break;
        }
        windows.push(Window {
            id: windows.len(),
            start: current_start,
            end: full_end.min(end),
        });
        match add_years(current_start, 1) {
            Some(next) => current_start = next,
            None => break,
        }
    }

    let covered_until = windows.last().map(|window| window.end);
    let needs_tail = covered_until.map_or(true, |covered| covered < end);
    if needs_tail && current_start < end {
        windows.push(Window {
            id: windows.len(),
            start: current_start,
            end,
        });
    }

    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn assert_covering(windows: &[Window], start: NaiveDate, end: NaiveDate) {
        assert_eq!(windows.first().unwrap().start, start);
        assert_eq!(windows.iter().map(|w| w.end).max().unwrap(), end);
        for pair in windows.windows(2) {
            assert!(pair[1].start <= pair[0].end, "gap between {:?}", pair);
            assert_eq!(add_years(pair[0].start, 1).unwrap(), pair[1].start);
        }
        for (i, window) in windows.iter().enumerate() {
            assert_eq!(window.id, i);
            assert!(window.end <= end);
            assert!(window.start < window.end);
        }
    }

    #[test]
    fn one_year_windows_step_by_year() {
        let windows = generate_windows(date(2018, 1, 1), date(2021, 1, 1), 1).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].start, date(2020, 1, 1));
        assert_eq!(windows[2].end, date(2021, 1, 1));
        assert_covering(&windows, date(2018, 1, 1), date(2021, 1, 1));
    }

    #[test]
    fn last_full_window_may_end_one_day_past_range() {
        let windows = generate_windows(date(2018, 1, 1), date(2019, 12, 31), 1).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].end, date(2019, 12, 31));
    }

    #[test]
    fn overlapping_windows_get_a_tail() {
        let windows = generate_windows(date(2015, 1, 1), date(2020, 6, 30), 3).unwrap();
        let starts: Vec<NaiveDate> = windows.iter().map(|w| w.start).collect();
        assert_eq!(
            starts,
            vec![
                date(2015, 1, 1),
                date(2016, 1, 1),
                date(2017, 1, 1),
                date(2018, 1, 1)
            ]
        );
        assert_eq!(windows[3].end, date(2020, 6, 30));
        assert_covering(&windows, date(2015, 1, 1), date(2020, 6, 30));
    }

    #[test]
    fn short_ranges_become_a_single_window() {
        let windows = generate_windows(date(2020, 3, 1), date(2020, 9, 1), 1).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, date(2020, 3, 1));
        assert_eq!(windows[0].end, date(2020, 9, 1));
    }

    #[test]
    fn rejects_empty_ranges() {
        assert!(generate_windows(date(2020, 1, 1), date(2020, 1, 1), 1).is_err());
        assert!(generate_windows(date(2020, 1, 1), date(2021, 1, 1), 0).is_err());
    }
}
