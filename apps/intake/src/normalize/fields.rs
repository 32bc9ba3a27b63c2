//! Best-effort field parsing over extracted resume text.
//!
//! Every parser is optional: a field that cannot be found stays `None` (or
//! empty). Nothing here reads the clock; open-ended date ranges resolve
//! against the caller's reference year.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::candidate::{Contact, PositionCategory, StructuredFields};
use crate::normalize::terms::{contains_term, count_term};

/// Technical vocabulary matched anywhere in the text.
const SKILL_VOCABULARY: &[&str] = &[
    "verilog",
    "systemverilog",
    "vhdl",
    "uvm",
    "rtl",
    "fpga",
    "asic",
    "formal verification",
    "static timing analysis",
    "synthesis",
    "emulation",
    "cadence",
    "synopsys",
    "primetime",
    "innovus",
    "jaspergold",
    "spice",
    "python",
    "perl",
    "tcl",
    "c++",
    "java",
    "rust",
    "matlab",
    "cuda",
    "pytorch",
    "tensorflow",
    "sql",
    "javascript",
    "typescript",
    "linux",
    "git",
    "docker",
    "kubernetes",
    "aws",
];

/// Category keyword table, in tie-break order.
const CATEGORY_KEYWORDS: &[(PositionCategory, &[&str])] = &[
    (PositionCategory::LogicDesign, &["logic design", "rtl design"]),
    (PositionCategory::PhysicalDesign, &["physical design", "place and route"]),
    (PositionCategory::FormalVerification, &["formal verification"]),
    (
        PositionCategory::DesignVerification,
        &["design verification", "emulation", "uvm"],
    ),
    (
        PositionCategory::Architecture,
        &["architecture", "architect", "microarchitecture"],
    ),
    (PositionCategory::Internship, &["internship", "intern"]),
    (PositionCategory::HumanResources, &["human resources", "hr", "recruiting"]),
];

const SECTION_HEADINGS: &[&str] = &[
    "experience",
    "work experience",
    "professional experience",
    "employment",
    "education",
    "projects",
    "publications",
    "certifications",
    "awards",
    "summary",
    "objective",
    "interests",
    "references",
];

const SKILL_HEADINGS: &[&str] = &[
    "skills",
    "technical skills",
    "core competencies",
    "technologies",
    "tools",
];

const NOT_A_NAME: &[&str] = &["resume", "résumé", "curriculum vitae", "cv", "profile"];

/// Reasonable upper bound for a career length claim.
const MAX_EXPERIENCE_YEARS: f64 = 50.0;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b")
            .expect("phone regex")
    })
}

fn years_claim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,2}(?:\.\d+)?)\s*\+?\s*(?:years?|yrs?)\b").expect("years regex")
    })
}

fn year_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b((?:19|20)\d{2})\s*(?:-|–|—|to)\s*((?:19|20)\d{2}|present|current|now)\b")
            .expect("year range regex")
    })
}

fn location_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:location|address)\s*[:\-]\s*(.+?)\s*$").expect("location regex")
    })
}

fn city_region_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Z][A-Za-z.' -]+,\s*[A-Z][A-Za-z]+(?: [A-Z][A-Za-z]+)?(?:\s+\d{5})?$")
            .expect("city regex")
    })
}

/// Parses every structured field out of cleaned text.
pub fn parse(text: &str, reference_year: i32) -> StructuredFields {
    let lowered = text.to_lowercase();
    StructuredFields {
        name: parse_name(text),
        contact: Contact {
            email: email_re()
                .find(text)
                .map(|m| m.as_str().to_lowercase()),
            phone: phone_re().find(text).map(|m| m.as_str().trim().to_string()),
        },
        skills: parse_skills(text, &lowered),
        experience_years: parse_experience_years(text, reference_year),
        location: parse_location(text),
        position_category: classify_position(&lowered),
        raw_text: text.to_string(),
    }
}

fn parse_name(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(5)
        .find_map(|line| {
            let line = strip_label(line, "name").unwrap_or(line);
            let lowered = line.to_lowercase();
            if NOT_A_NAME.contains(&lowered.as_str()) {
                return None;
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            if !(2..=4).contains(&words.len()) {
                return None;
            }
            let looks_like_name = words.iter().all(|w| {
                w.chars().next().is_some_and(char::is_uppercase)
                    && w.chars()
                        .all(|c| c.is_alphabetic() || matches!(c, '.' | '-' | '\''))
            });
            looks_like_name.then(|| {
                words
                    .iter()
                    .map(|w| capitalize_if_shouting(w))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
        })
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let (head, tail) = line.split_once(':')?;
    head.trim()
        .eq_ignore_ascii_case(label)
        .then(|| tail.trim())
}

/// "JANE" → "Jane"; mixed case is left alone ("McDonald").
fn capitalize_if_shouting(word: &str) -> String {
    if word.chars().any(char::is_lowercase) {
        return word.to_string();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_string() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn parse_skills(text: &str, lowered: &str) -> Vec<String> {
    let mut skills: BTreeSet<String> = BTreeSet::new();

    for term in SKILL_VOCABULARY {
        if contains_term(lowered, term) {
            skills.insert(term.to_string());
        }
    }

    let mut in_section = false;
    for line in text.lines().map(str::trim) {
        let lowered_line = line.to_lowercase();
        let heading = lowered_line.trim_end_matches(':').trim();

        if let Some(items) = skill_heading_items(&lowered_line) {
            in_section = true;
            collect_skill_items(items, &mut skills);
            continue;
        }
        if !in_section {
            continue;
        }
        if line.is_empty() || SECTION_HEADINGS.contains(&heading) {
            in_section = false;
            continue;
        }
        collect_skill_items(&lowered_line, &mut skills);
    }

    skills.into_iter().collect()
}

/// For a skills heading line returns the text after the heading (possibly empty).
fn skill_heading_items(lowered_line: &str) -> Option<&str> {
    SKILL_HEADINGS.iter().find_map(|heading| {
        let rest = lowered_line.strip_prefix(heading)?;
        let rest = rest.trim_start();
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix(':').map(str::trim)
        }
    })
}

fn collect_skill_items(line: &str, skills: &mut BTreeSet<String>) {
    for item in line.split([',', ';', '•', '|', '·']) {
        let item = item
            .trim()
            .trim_start_matches(['-', '*'])
            .trim()
            .trim_end_matches('.');
        if item.is_empty() || item.len() > 40 || item.split_whitespace().count() > 4 {
            continue;
        }
        skills.insert(item.to_string());
    }
}

fn parse_experience_years(text: &str, reference_year: i32) -> Option<f64> {
    let claimed = years_claim_re()
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .filter(|years| *years > 0.0 && *years <= MAX_EXPERIENCE_YEARS)
        .fold(None, |best: Option<f64>, years| {
            Some(best.map_or(years, |b| b.max(years)))
        });
    if claimed.is_some() {
        return claimed;
    }

    let mut earliest: Option<i32> = None;
    let mut latest: Option<i32> = None;
    for caps in year_range_re().captures_iter(text) {
        let Ok(start) = caps[1].parse::<i32>() else {
            continue;
        };
        let end = caps[2].parse::<i32>().unwrap_or(reference_year);
        if end < start || start > reference_year {
            continue;
        }
        earliest = Some(earliest.map_or(start, |e| e.min(start)));
        latest = Some(latest.map_or(end, |l| l.max(end)));
    }
    match (earliest, latest) {
        (Some(start), Some(end)) if end > start => {
            Some(f64::from(end - start).min(MAX_EXPERIENCE_YEARS))
        }
        _ => None,
    }
}

fn parse_location(text: &str) -> Option<String> {
    if let Some(caps) = location_label_re().captures(text) {
        let value = caps[1].trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    text.lines().take(10).find_map(|line| {
        line.split(['|', '•', '·'])
            .map(str::trim)
            .find(|segment| city_region_re().is_match(segment))
            .map(String::from)
    })
}

fn classify_position(lowered: &str) -> PositionCategory {
    let mut best = (PositionCategory::Other, 0usize);
    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits: usize = keywords.iter().map(|k| count_term(lowered, k)).sum();
        if hits > best.1 {
            best = (*category, hits);
        }
    }
    best.0
}
