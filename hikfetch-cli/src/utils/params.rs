use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use hikfetch_engine::ChannelId;
use tracing::debug;

use crate::error::AppError;

/// Parses a channel list such as `"1,3-6,8"`.
///
/// Items are single channel numbers or inclusive ranges, separated by commas.
/// The result is sorted and free of duplicates.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` for empty lists, channel 0, reversed
/// ranges or anything that is not a number.
///
/// # Examples
///
/// ```
/// use hikfetch::utils::parse_channel_list;
///
/// let channels = parse_channel_list("8,1,3-6,4").unwrap();
/// let ids: Vec<u32> = channels.iter().map(|c| c.get()).collect();
/// assert_eq!(ids, vec![1, 3, 4, 5, 6, 8]);
/// ```
pub fn parse_channel_list(input: &str) -> Result<Vec<ChannelId>, AppError> {
    let mut ids = Vec::new();

    for item in input.split(',').map(str::trim) {
        if item.is_empty() {
            continue;
        }
        match item.split_once('-') {
            Some((from, to)) => {
                let from = parse_channel_number(from)?;
                let to = parse_channel_number(to)?;
                if to < from {
                    return Err(AppError::InvalidInput(format!(
                        "channel range `{item}` is reversed"
                    )));
                }
                ids.extend(from..=to);
            }
            None => ids.push(parse_channel_number(item)?),
        }
    }

    if ids.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "channel list `{input}` names no channels"
        )));
    }

    ids.sort_unstable();
    ids.dedup();
    debug!("Parsed channel list {input:?} into {} channels", ids.len());

    Ok(ids.into_iter().filter_map(ChannelId::new).collect())
}

fn parse_channel_number(text: &str) -> Result<u32, AppError> {
    let text = text.trim();
    let id: u32 = text
        .parse()
        .map_err(|_| AppError::InvalidInput(format!("`{text}` is not a channel number")))?;
    if ChannelId::new(id).is_none() {
        return Err(AppError::InvalidInput(format!(
            "channel numbers range from 1 to {}",
            ChannelId::MAX
        )));
    }
    Ok(id)
}

/// Combines a `YYYY-MM-DD` date and an `HH:MM[:SS]` time.
pub fn parse_datetime(date: &str, time: &str) -> Result<NaiveDateTime, AppError> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|e| {
        AppError::InvalidInput(format!("invalid date `{date}` (expected YYYY-MM-DD): {e}"))
    })?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time.trim(), "%H:%M"))
        .map_err(|e| {
            AppError::InvalidInput(format!("invalid time `{time}` (expected HH:MM:SS): {e}"))
        })?;
    Ok(date.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(input: &str) -> Vec<u32> {
        parse_channel_list(input)
            .unwrap()
            .into_iter()
            .map(ChannelId::get)
            .collect()
    }

    #[test]
    fn parses_singles_and_ranges() {
        assert_eq!(ids("1,3-6,8"), vec![1, 3, 4, 5, 6, 8]);
        assert_eq!(ids(" 2 , 2-3 ,1"), vec![1, 2, 3]);
        assert_eq!(ids("7"), vec![7]);
        assert_eq!(ids("4-4"), vec![4]);
    }

    #[test]
    fn rejects_bad_lists() {
        for bad in ["", ",", "0", "1,0-2", "6-3", "a", "1-b", "1--3", "10000"] {
            assert!(
                matches!(parse_channel_list(bad), Err(AppError::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_date_and_time() {
        let dt = parse_datetime("2024-11-25", "08:30:15").unwrap();
        assert_eq!(dt.to_string(), "2024-11-25 08:30:15");
        let dt = parse_datetime("2024-11-25", "18:00").unwrap();
        assert_eq!(dt.to_string(), "2024-11-25 18:00:00");
        assert!(parse_datetime("25.11.2024", "08:00:00").is_err());
        assert!(parse_datetime("2024-11-25", "25:00:00").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_channel_list_is_sorted_and_unique(
            singles in proptest::collection::vec(1u32..64, 0..8),
            ranges in proptest::collection::vec((1u32..64, 0u32..6), 0..4),
        ) {
            prop_assume!(!singles.is_empty() || !ranges.is_empty());

            let mut parts: Vec<String> = singles.iter().map(u32::to_string).collect();
            parts.extend(ranges.iter().map(|(from, len)| format!("{from}-{}", from + len)));
            let parsed = ids(&parts.join(","));

            let mut expected: Vec<u32> = singles.clone();
            for (from, len) in &ranges {
                expected.extend(*from..=from + len);
            }
            expected.sort_unstable();
            expected.dedup();

            prop_assert_eq!(parsed, expected);
        }
    }
}
