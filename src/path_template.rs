// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Renders the uploader's destination path template: a string with
//! `{event.start}`-style placeholders, evaluated against a fixed field set
//! (spec §4.5) and sanitized to a conservative filename character class.

use base::{bail, Error};
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, take_while1};
use nom::combinator::map;
use nom::multi::many0;
use nom::sequence::delimited;
use nom::IResult;

use crate::event::{Event, EventType};

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Vec<String>),
}

fn field_path(input: &str) -> IResult<&str, Vec<String>> {
    nom::multi::separated_list1(
        tag("."),
        map(
            take_while1(|c: char| c.is_alphanumeric() || c == '_'),
            str::to_string,
        ),
    )(input)
}

fn placeholder(input: &str) -> IResult<&str, Segment> {
    map(delimited(tag("{"), field_path, tag("}")), Segment::Field)(input)
}

fn literal(input: &str) -> IResult<&str, Segment> {
    map(is_not("{"), |s: &str| Segment::Literal(s.to_string()))(input)
}

fn template(input: &str) -> IResult<&str, Vec<Segment>> {
    many0(alt((placeholder, literal)))(input)
}

/// A template compiled once at config-load time and rendered per event.
pub struct PathTemplate(Vec<Segment>);

/// The fields available to a template, computed fresh for each event.
/// `local_start`/`local_end` must already be converted to the NVR's
/// timezone -- this module never looks at a timezone itself.
pub struct FieldContext<'a> {
    pub event: &'a Event,
    pub local_start: &'a jiff::Zoned,
    pub local_end: &'a jiff::Zoned,
    pub duration_seconds: f64,
    pub detection_type: String,
    pub camera_name: String,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let (remaining, segments) = template(raw)
            .map_err(|_e| err_invalid(raw))?;
        if !remaining.is_empty() {
            return Err(err_invalid(raw));
        }
        Ok(PathTemplate(segments))
    }

    pub fn render(&self, ctx: &FieldContext) -> Result<String, Error> {
        let mut out = String::new();
        for seg in &self.0 {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(path) => out.push_str(&resolve(path, ctx)?),
            }
        }
        Ok(sanitize(&out))
    }
}

fn err_invalid(raw: &str) -> Error {
    base::err!(InvalidArgument, msg("invalid path template {raw:?}"))
}

fn resolve(path: &[String], ctx: &FieldContext) -> Result<String, Error> {
    match path[0].as_str() {
        "duration_seconds" => Ok(format!("{:.3}", ctx.duration_seconds)),
        "detection_type" => Ok(ctx.detection_type.clone()),
        "camera_name" => Ok(ctx.camera_name.clone()),
        "event" => {
            let Some(field) = path.get(1) else {
                bail!(
                    InvalidArgument,
                    msg("{{event}} requires an attribute, e.g. {{event.start}}")
                );
            };
            resolve_event_field(field, ctx)
        }
        other => bail!(InvalidArgument, msg("unknown template field {{{other}}}")),
    }
}

fn resolve_event_field(field: &str, ctx: &FieldContext) -> Result<String, Error> {
    Ok(match field {
        "id" => ctx.event.canonical_id().to_string(),
        "camera_id" => ctx.event.camera_id.clone(),
        "type" => ctx.event.event_type.as_str().to_string(),
        "start" => ctx.local_start.to_string(),
        "end" => ctx.local_end.to_string(),
        other => bail!(InvalidArgument, msg("unknown event field {{event.{other}}}")),
    })
}

/// Matches the Python original's `re.sub(r'[^\w\-_\.\(\)/ ]', '', ...)`.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric() || "-_./() ".contains(*c))
        .collect()
}

/// Builds the `detection_type` field: the bare type name, or (for smart
/// detections) the type followed by its subtypes in parentheses.
pub fn detection_type_field(event_type: EventType, smart_detect_types: &[String]) -> String {
    if smart_detect_types.is_empty() {
        event_type.as_str().to_string()
    } else {
        format!("{} ({})", event_type.as_str(), smart_detect_types.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: "abc".to_string(),
            event_type: EventType::Motion,
            camera_id: "cam1".to_string(),
            smart_detect_types: Vec::new(),
            start: jiff::Timestamp::from_second(1_700_000_000).unwrap(),
            end: Some(jiff::Timestamp::from_second(1_700_000_010).unwrap()),
        }
    }

    fn zoned(ts: jiff::Timestamp) -> jiff::Zoned {
        ts.to_zoned(jiff::tz::TimeZone::UTC)
    }

    #[test]
    fn renders_literals_and_fields() {
        let tpl = PathTemplate::parse("{camera_name}/{event.id}.mp4").unwrap();
        let event = sample_event();
        let ctx = FieldContext {
            event: &event,
            local_start: &zoned(event.start),
            local_end: &zoned(event.end.unwrap()),
            duration_seconds: 10.0,
            detection_type: "motion".to_string(),
            camera_name: "Front Door".to_string(),
        };
        assert_eq!(tpl.render(&ctx).unwrap(), "Front Door/abc.mp4");
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        let tpl = PathTemplate::parse("{camera_name}.mp4").unwrap();
        let event = sample_event();
        let ctx = FieldContext {
            event: &event,
            local_start: &zoned(event.start),
            local_end: &zoned(event.end.unwrap()),
            duration_seconds: 1.0,
            detection_type: "motion".to_string(),
            camera_name: "Front;Door$".to_string(),
        };
        assert_eq!(tpl.render(&ctx).unwrap(), "FrontDoor.mp4");
    }

    #[test]
    fn unknown_field_is_an_error() {
        let tpl = PathTemplate::parse("{nonsense}").unwrap();
        let event = sample_event();
        let ctx = FieldContext {
            event: &event,
            local_start: &zoned(event.start),
            local_end: &zoned(event.end.unwrap()),
            duration_seconds: 1.0,
            detection_type: "motion".to_string(),
            camera_name: "x".to_string(),
        };
        tpl.render(&ctx).unwrap_err();
    }

    #[test]
    fn detection_type_field_joins_smart_subtypes() {
        assert_eq!(
            detection_type_field(EventType::SmartDetect, &["person".to_string(), "vehicle".to_string()]),
            "smartDetectZone (person vehicle)"
        );
        assert_eq!(detection_type_field(EventType::Motion, &[]), "motion");
    }
}
