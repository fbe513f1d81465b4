//! Calendar provider client and the business-rule validation order for
//! `create_calendar_event`. OAuth/token-refresh is provider-internal and out
//! of scope; the Bridge only ever holds a short-lived access token.

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};

use crate::store::CalendarSettings;

/// A hung calendar backend must not hang the call — the dispatcher needs a
/// bounded wait so it can fall back to a `{error}` result instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

pub struct CalendarClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl CalendarClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    pub async fn check_availability(&self, business_id: i64, date: &str) -> Value {
        let time_min = format!("{date}T00:00:00Z");
        let time_max = format!("{date}T23:59:59Z");
        match self.free_busy(business_id, &time_min, &time_max).await {
            Ok(busy) => json!({ "count": busy.len(), "busy": busy }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    async fn free_busy(
        &self,
        business_id: i64,
        time_min: &str,
        time_max: &str,
    ) -> Result<Vec<Value>, CalendarError> {
        let resp = self
            .client
            .post(format!("{}/freebusy", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&json!({
                "business_id": business_id,
                "time_min": time_min,
                "time_max": time_max,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(CalendarError::Api(resp.status().to_string()));
        }

        let body: Value = resp.json().await?;
        Ok(body.get("busy").and_then(Value::as_array).cloned().unwrap_or_default())
    }

    async fn create(
        &self,
        business_id: i64,
        summary: &str,
        start: &str,
        end: &str,
        description: &str,
    ) -> Result<Value, CalendarError> {
        let resp = self
            .client
            .post(format!("{}/events", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&json!({
                "business_id": business_id,
                "summary": summary,
                "start": start,
                "end": end,
                "description": description,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(CalendarError::Api(resp.status().to_string()));
        }

        Ok(resp.json().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("calendar API error: {0}")]
    Api(String),
}

/// Validate and create an event, in the exact order `original_source`'s
/// `_execute_create_calendar_event` does: derive end_time, business hours,
/// booking horizon, conflict check, create.
pub async fn create_event_with_validation(
    client: &CalendarClient,
    business_id: i64,
    settings: &CalendarSettings,
    args: &Value,
) -> Value {
    let summary = args.get("summary").and_then(Value::as_str).unwrap_or("").to_string();
    let date = args.get("date").and_then(Value::as_str).unwrap_or("").to_string();
    let start_time = args.get("start_time").and_then(Value::as_str).unwrap_or("").to_string();
    let description = args.get("description").and_then(Value::as_str).unwrap_or("").to_string();
    let mut end_time = args.get("end_time").and_then(Value::as_str).unwrap_or("").to_string();

    if end_time.is_empty() {
        match derive_end_time(&start_time, settings.default_duration_minutes) {
            Some(derived) => end_time = derived,
            None => return json!({ "error": "could not parse start_time" }),
        }
    }

    if let Some(err) = reject_outside_business_hours(&start_time, &end_time, settings) {
        return err;
    }

    if let Some(err) = reject_outside_booking_window(&date, settings) {
        return err;
    }

    if !settings.allow_conflicts {
        let time_min = format!("{date}T{start_time}:00Z");
        let time_max = format!("{date}T{end_time}:00Z");
        match client.free_busy(business_id, &time_min, &time_max).await {
            Ok(busy) if !busy.is_empty() => return conflict_error(&busy[0]),
            Err(e) => return json!({ "error": e.to_string() }),
            _ => {}
        }
    }

    let start_dt = format!("{date}T{start_time}:00");
    let end_dt = format!("{date}T{end_time}:00");
    match client.create(business_id, &summary, &start_dt, &end_dt, &description).await {
        Ok(result) => result,
        Err(e) => json!({ "error": e.to_string() }),
    }
}

fn derive_end_time(start_time: &str, default_duration_minutes: u32) -> Option<String> {
    let start = NaiveTime::parse_from_str(start_time, "%H:%M").ok()?;
    let end = start + chrono::Duration::minutes(default_duration_minutes as i64);
    Some(end.format("%H:%M").to_string())
}

fn reject_outside_business_hours(
    start_time: &str,
    end_time: &str,
    settings: &CalendarSettings,
) -> Option<Value> {
    if start_time < settings.business_hours_start.as_str()
        || end_time > settings.business_hours_end.as_str()
    {
        return Some(json!({ "error": format!(
            "Appointment must be within business hours ({} to {}). Please choose a different time.",
            settings.business_hours_start, settings.business_hours_end
        ) }));
    }
    None
}

fn reject_outside_booking_window(date: &str, settings: &CalendarSettings) -> Option<Value> {
    let Ok(event_date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
        // Malformed dates are left for the calendar API to reject.
        return None;
    };
    let days_ahead = (event_date - Utc::now().date_naive()).num_days();
    if days_ahead > settings.booking_window_days {
        return Some(json!({ "error": format!(
            "Cannot book more than {} days in advance. Please choose an earlier date.",
            settings.booking_window_days
        ) }));
    }
    if days_ahead < 0 {
        return Some(json!({ "error": "Cannot book appointments in the past." }));
    }
    None
}

fn conflict_error(conflict: &Value) -> Value {
    json!({ "error": format!(
        "There's already an appointment at that time (busy from {} to {}). Please choose a different time.",
        conflict.get("start").and_then(Value::as_str).unwrap_or("?"),
        conflict.get("end").and_then(Value::as_str).unwrap_or("?"),
    ) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CalendarSettings {
        CalendarSettings {
            default_duration_minutes: 30,
            allow_conflicts: false,
            booking_window_days: 30,
            business_hours_start: "09:00".to_string(),
            business_hours_end: "17:00".to_string(),
        }
    }

    #[test]
    fn derives_end_time_from_default_duration() {
        assert_eq!(derive_end_time("10:00", 30).as_deref(), Some("10:30"));
        assert_eq!(derive_end_time("16:45", 30).as_deref(), Some("17:15"));
    }

    #[test]
    fn derive_end_time_rejects_unparseable_start() {
        assert_eq!(derive_end_time("not-a-time", 30), None);
    }

    #[test]
    fn rejects_start_before_business_hours() {
        let err = reject_outside_business_hours("08:00", "08:30", &settings()).unwrap();
        assert!(err["error"].as_str().unwrap().contains("business hours"));
    }

    #[test]
    fn rejects_end_after_business_hours() {
        let err = reject_outside_business_hours("16:45", "17:30", &settings()).unwrap();
        assert!(err["error"].as_str().unwrap().contains("business hours"));
    }

    #[test]
    fn accepts_slot_within_business_hours() {
        assert!(reject_outside_business_hours("09:00", "09:30", &settings()).is_none());
    }

    #[test]
    fn rejects_past_dates() {
        let err = reject_outside_booking_window("2000-01-01", &settings()).unwrap();
        assert!(err["error"].as_str().unwrap().contains("past"));
    }

    #[test]
    fn rejects_dates_beyond_booking_window() {
        let far_future = (Utc::now().date_naive() + chrono::Duration::days(90))
            .format("%Y-%m-%d")
            .to_string();
        let err = reject_outside_booking_window(&far_future, &settings()).unwrap();
        assert!(err["error"].as_str().unwrap().contains("advance"));
    }

    #[test]
    fn malformed_date_is_left_for_the_calendar_api() {
        assert_eq!(reject_outside_booking_window("not-a-date", &settings()), None);
    }

    #[test]
    fn conflict_error_names_the_busy_window() {
        let err = conflict_error(&json!({"start": "10:00", "end": "10:30"}));
        let message = err["error"].as_str().unwrap();
        assert!(message.contains("10:00"));
        assert!(message.contains("10:30"));
    }
}
