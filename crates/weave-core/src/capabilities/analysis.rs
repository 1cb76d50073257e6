//! Analysis capabilities: cost analysis, preference matching, summarizing.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{Capability, CapabilityError, PreparedInputs, RunContext, RunValue};

fn price_of(option: &Value) -> f64 {
    option.get("price").and_then(Value::as_f64).unwrap_or(f64::MAX)
}

fn price_per_hour(option: &Value) -> f64 {
    let price = price_of(option);
    match option.get("duration_minutes").and_then(Value::as_f64) {
        Some(minutes) if minutes > 0.0 => price / (minutes / 60.0),
        _ => price,
    }
}

/// Ranks priced options by cost and by value (price per hour).
pub struct CostAnalysis;

#[async_trait]
impl Capability for CostAnalysis {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let options = prepared
            .require("flight_options")?
            .as_array()
            .cloned()
            .unwrap_or_default();
        if options.is_empty() {
            return Ok(RunValue::data([(
                "cost_analysis",
                json!({"summary": "No options to analyze"}),
            )]));
        }

        let cheapest = options
            .iter()
            .min_by(|a, b| price_of(a).total_cmp(&price_of(b)))
            .cloned()
            .unwrap_or(Value::Null);
        let best_value = options
            .iter()
            .min_by(|a, b| price_per_hour(a).total_cmp(&price_per_hour(b)))
            .cloned()
            .unwrap_or(Value::Null);

        let recommendation = format!(
            "Best value: {} {} at ${}",
            best_value["airline"].as_str().unwrap_or("?"),
            best_value["flight_number"].as_str().unwrap_or("?"),
            best_value["price"],
        );
        Ok(RunValue::data([(
            "cost_analysis",
            json!({
                "cheapest": cheapest,
                "best_value": best_value,
                "recommendation": recommendation,
            }),
        )]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("cost_analysis")
                .and_then(|a| a.get("recommendation"))
                .and_then(Value::as_str)
                .map(str::to_string),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

/// Picks the option best matching the user's stated preferences.
///
/// Keyword heuristics: "cheap"/"budget" picks the lowest price,
/// "value" the best price per hour, "afternoon"/"morning" filters by
/// departure when the data carries one.
pub struct PreferenceMatcher;

#[async_trait]
impl Capability for PreferenceMatcher {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let options = prepared
            .require("flight_options")?
            .as_array()
            .cloned()
            .unwrap_or_default();
        if options.is_empty() {
            return Err(CapabilityError::InvalidInput(
                "no options to match against".into(),
            ));
        }
        let preferences = prepared
            .get("preferences")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();

        let mut candidates: Vec<Value> = options.clone();
        if preferences.contains("afternoon") {
            let filtered: Vec<Value> = candidates
                .iter()
                .filter(|o| {
                    o.get("departure")
                        .and_then(Value::as_str)
                        .and_then(|d| d.split(':').next())
                        .and_then(|h| h.parse::<u32>().ok())
                        .map_or(true, |h| (12..18).contains(&h))
                })
                .cloned()
                .collect();
            if !filtered.is_empty() {
                candidates = filtered;
            }
        }

        let matched = if preferences.contains("cheap") || preferences.contains("budget") {
            candidates
                .iter()
                .min_by(|a, b| price_of(a).total_cmp(&price_of(b)))
        } else if preferences.contains("value") {
            candidates
                .iter()
                .min_by(|a, b| price_per_hour(a).total_cmp(&price_per_hour(b)))
        } else {
            candidates.first()
        }
        .cloned()
        .unwrap_or(Value::Null);

        Ok(RunValue::data([("matched_option", matched)]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs.get("matched_option").map(|m| {
                format!(
                    "Matched {} {}",
                    m["airline"].as_str().unwrap_or("option"),
                    m["flight_number"].as_str().unwrap_or(""),
                )
            }),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

/// Produces a readable summary of accumulated results.
pub struct ResultSummarizer;

#[async_trait]
impl Capability for ResultSummarizer {
    async fn run(
        &self,
        prepared: &PreparedInputs,
        _ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError> {
        let question = prepared
            .get("user_question")
            .and_then(Value::as_str)
            .unwrap_or("your request");
        let results = prepared.require("results")?;

        let body = match results {
            Value::Array(items) => format!("{} result(s) gathered", items.len()),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| format!("{k}: {}", compact(v)))
                .collect::<Vec<_>>()
                .join("; "),
            other => compact(other),
        };
        let summary = format!("For {question}: {body}");
        Ok(RunValue::data([("summary", json!(summary))]))
    }

    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.chars().take(120).collect(),
        other => {
            let s = other.to_string();
            s.chars().take(120).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flight(number: &str, price: u64, minutes: u64, departure: &str) -> Value {
        json!({
            "airline": "Test Air",
            "flight_number": number,
            "price": price,
            "duration_minutes": minutes,
            "departure": departure,
        })
    }

    fn inputs_with_options(options: Value) -> PreparedInputs {
        let mut prepared = PreparedInputs::new();
        prepared.insert("flight_options", options);
        prepared
    }

    #[tokio::test]
    async fn test_cost_analysis_picks_cheapest_and_best_value() {
        let options = json!([
            flight("AA1", 900, 600, "09:00"),
            flight("AA2", 700, 800, "14:00"),
            flight("AA3", 750, 500, "15:00"),
        ]);
        let value = CostAnalysis
            .run(&inputs_with_options(options), &RunContext::for_tests())
            .await
            .unwrap();
        let RunValue::Data(outputs) = value else {
            panic!("expected data")
        };
        let analysis = &outputs["cost_analysis"];
        assert_eq!(analysis["cheapest"]["flight_number"], "AA2");
        // AA2 is also the best rate: 700 over 13.3h
        assert_eq!(analysis["best_value"]["flight_number"], "AA2");
    }

    #[tokio::test]
    async fn test_preference_matcher_cheap() {
        let options = json!([flight("AA1", 900, 600, "09:00"), flight("AA2", 700, 800, "14:00")]);
        let mut prepared = inputs_with_options(options);
        prepared.insert("preferences", json!("cheap and cheerful"));
        let value = PreferenceMatcher
            .run(&prepared, &RunContext::for_tests())
            .await
            .unwrap();
        let RunValue::Data(outputs) = value else {
            panic!("expected data")
        };
        assert_eq!(outputs["matched_option"]["flight_number"], "AA2");
    }

    #[tokio::test]
    async fn test_preference_matcher_afternoon_value() {
        let options = json!([
            flight("AA1", 500, 600, "09:00"),
            flight("AA2", 700, 700, "14:00"),
            flight("AA3", 800, 700, "16:00"),
        ]);
        let mut prepared = inputs_with_options(options);
        prepared.insert("preferences", json!("afternoon, value"));
        let value = PreferenceMatcher
            .run(&prepared, &RunContext::for_tests())
            .await
            .unwrap();
        let RunValue::Data(outputs) = value else {
            panic!("expected data")
        };
        // morning flight filtered out despite the better rate
        assert_eq!(outputs["matched_option"]["flight_number"], "AA2");
    }

    #[tokio::test]
    async fn test_summarizer_mentions_question() {
        let mut prepared = PreparedInputs::new();
        prepared.insert("results", json!({"booking": "confirmed"}));
        prepared.insert("user_question", json!("book LAX to PVG"));
        let value = ResultSummarizer
            .run(&prepared, &RunContext::for_tests())
            .await
            .unwrap();
        let RunValue::Data(outputs) = value else {
            panic!("expected data")
        };
        let summary = outputs["summary"].as_str().unwrap();
        assert!(summary.contains("book LAX to PVG"));
        assert!(summary.contains("booking"));
    }
}
