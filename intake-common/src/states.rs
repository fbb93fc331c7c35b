use thiserror::Error;

/// States matched when a request does not say otherwise: in progress and ineligible.
pub const DEFAULT_STATES: [i32; 2] = [0, 1];

/// Upper bound on how many states a single `a-b` range may expand to.
pub const MAX_RANGE_SPAN: i64 = 1000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateFilterError {
    #[error("'{0}' is not a valid state range")]
    MalformedRange(String),
    #[error("state range '{0}' spans more than {MAX_RANGE_SPAN} states")]
    RangeTooWide(String),
}

/// Translate the `states` query parameter into the set of funnel states to match.
///
/// - `None` yields [`DEFAULT_STATES`].
/// - A value containing a hyphen is an inclusive range `a-b`; the bounds may come in either
///   order and every integer between them is produced in ascending order. Only the first two
///   hyphen-separated parts are read.
/// - Anything else is a comma separated list. Tokens that are not integers are dropped and
///   the remaining ones keep their order of appearance.
///
/// Negative values and out-of-range states are not rejected, they simply match nothing.
pub fn parse_state_filter(raw: Option<&str>) -> Result<Vec<i32>, StateFilterError> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_STATES.to_vec());
    };

    if raw.contains('-') {
        return parse_range(raw);
    }

    Ok(raw
        .split(',')
        .filter_map(|token| token.trim().parse::<i32>().ok())
        .collect())
}

fn parse_range(raw: &str) -> Result<Vec<i32>, StateFilterError> {
    let mut bounds = raw.split('-').map(|bound| bound.trim().parse::<i32>());

    let (Some(Ok(a)), Some(Ok(b))) = (bounds.next(), bounds.next()) else {
        return Err(StateFilterError::MalformedRange(raw.to_owned()));
    };

    let (lo, hi) = (a.min(b), a.max(b));
    if i64::from(hi) - i64::from(lo) >= MAX_RANGE_SPAN {
        return Err(StateFilterError::RangeTooWide(raw.to_owned()));
    }

    Ok((lo..=hi).collect())
}
