// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Parser for the calendar-relative duration grammar used by `retention` and
//! `purgeInterval` config fields: additive terms like `7d3h15m`, with
//! suffixes `ms`, `s`, `m`, `h`, `d`, `w`, `M` (month), `y` (year).
//!
//! Month/year terms are calendar-relative, not fixed-length, so the result
//! is a [`jiff::Span`] rather than a plain `Duration`; callers add it to a
//! [`jiff::Zoned`] to get a concrete instant.

use jiff::Span;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::space0;
use nom::combinator::{map, map_res, value};
use nom::multi::fold_many1;
use nom::sequence::{delimited, tuple};
use nom::IResult;

use crate::{err, Error};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Unit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

fn unit(input: &str) -> IResult<&str, Unit> {
    alt((
        value(Unit::Milliseconds, tag("ms")),
        value(Unit::Months, tag("M")),
        value(Unit::Minutes, tag("m")),
        value(Unit::Seconds, tag("s")),
        value(Unit::Hours, tag("h")),
        value(Unit::Days, tag("d")),
        value(Unit::Weeks, tag("w")),
        value(Unit::Years, tag("y")),
    ))(input)
}

fn term(input: &str) -> IResult<&str, (i64, Unit)> {
    map(
        tuple((
            map_res(nom::character::complete::digit1, |s: &str| s.parse::<i64>()),
            unit,
        )),
        |(n, u)| (n, u),
    )(input)
}

#[derive(Default)]
struct Accum {
    ms: i64,
    s: i64,
    mi: i64,
    h: i64,
    d: i64,
    w: i64,
    mo: i64,
    y: i64,
}

fn duration_internal(input: &str) -> IResult<&str, Accum> {
    fold_many1(
        delimited(space0, term, space0),
        Accum::default,
        |mut acc, (n, u)| {
            match u {
                Unit::Milliseconds => acc.ms += n,
                Unit::Seconds => acc.s += n,
                Unit::Minutes => acc.mi += n,
                Unit::Hours => acc.h += n,
                Unit::Days => acc.d += n,
                Unit::Weeks => acc.w += n,
                Unit::Months => acc.mo += n,
                Unit::Years => acc.y += n,
            }
            acc
        },
    )(input)
}

/// Parses a string like `7d3h15m` into a calendar-relative [`Span`].
pub fn parse(encoded: &str) -> Result<Span, Error> {
    let (remaining, acc) = duration_internal(encoded)
        .map_err(|_e| err!(InvalidArgument, msg("invalid duration {encoded:?}")))?;
    if !remaining.is_empty() {
        return Err(err!(
            InvalidArgument,
            msg("unexpected trailing text in duration {encoded:?}: {remaining:?}")
        ));
    }
    Ok(Span::new()
        .years(acc.y)
        .months(acc.mo)
        .weeks(acc.w)
        .days(acc.d)
        .hours(acc.h)
        .minutes(acc.mi)
        .seconds(acc.s)
        .milliseconds(acc.ms))
}

/// Converts a parsed span into a fixed-length [`std::time::Duration`],
/// treating days/weeks/months/years as their nominal fixed lengths. Used
/// only for sleep/threshold durations (the max event length gate, the
/// purge/reconcile interval timers), never for calendar-accurate retention
/// cutoffs, which add the `Span` to a `Zoned` "now" instead.
pub fn to_std(span: Span) -> std::time::Duration {
    let seconds = span.get_milliseconds() as f64 / 1000.0
        + span.get_seconds() as f64
        + span.get_minutes() as f64 * 60.0
        + span.get_hours() as f64 * 3600.0
        + span.get_days() as f64 * 86400.0
        + span.get_weeks() as f64 * 7.0 * 86400.0
        + span.get_months() as f64 * 30.0 * 86400.0
        + span.get_years() as f64 * 365.0 * 86400.0;
    std::time::Duration::from_secs_f64(seconds.max(0.0))
}

/// Subtracts a calendar-relative span from an instant, treating it as UTC
/// wall-clock time. Used for retention cutoffs and reconciliation lookback
/// windows, where the span may include calendar units (days, months) that
/// only make sense relative to a timezone.
pub fn before(ts: jiff::Timestamp, span: Span) -> jiff::Timestamp {
    ts.to_zoned(jiff::tz::TimeZone::UTC)
        .checked_sub(span)
        .map(|z| z.timestamp())
        .unwrap_or(ts)
}
