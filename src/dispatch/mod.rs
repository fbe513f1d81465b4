//! Function-call dispatch: routes tool calls emitted by the Realtime API to
//! retrieval, calendar, or call-termination handlers.

pub mod calendar;
pub mod knowledge_base;

use serde_json::{json, Value};
use std::time::Duration;

use crate::store::{AgentConfigSnapshot, CalendarSettings};
use calendar::CalendarClient;
use knowledge_base::KnowledgeBaseClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    SearchKnowledgeBase,
    EndCall,
    CheckCalendar,
    CreateCalendarEvent,
}

impl Tool {
    pub fn name(self) -> &'static str {
        match self {
            Tool::SearchKnowledgeBase => "search_knowledge_base",
            Tool::EndCall => "end_call",
            Tool::CheckCalendar => "check_calendar",
            Tool::CreateCalendarEvent => "create_calendar_event",
        }
    }

    fn definition(self) -> Value {
        match self {
            Tool::SearchKnowledgeBase => json!({
                "type": "function",
                "name": "search_knowledge_base",
                "description": "Search the business's uploaded knowledge base documents using semantic similarity. Returns matching text chunks ranked by relevance score, or a not-found message if no matches exist.",
                "parameters": {
                    "type": "object",
                    "properties": { "query": { "type": "string", "description": "Natural language search query to match against document content" } },
                    "required": ["query"]
                }
            }),
            Tool::EndCall => json!({
                "type": "function",
                "name": "end_call",
                "description": "Terminate the active phone call and disconnect all parties. Returns a success or failure status with a message.",
                "parameters": {
                    "type": "object",
                    "properties": { "reason": { "type": "string", "description": "Brief explanation of why the call is ending" } },
                    "required": ["reason"]
                }
            }),
            Tool::CheckCalendar => json!({
                "type": "function",
                "name": "check_calendar",
                "description": "Check availability on a given date. Returns busy time slots (start/end times when calendar is occupied).",
                "parameters": {
                    "type": "object",
                    "properties": { "date": { "type": "string", "description": "Date to check in YYYY-MM-DD format (e.g. 2026-01-28)" } },
                    "required": ["date"]
                }
            }),
            Tool::CreateCalendarEvent => json!({
                "type": "function",
                "name": "create_calendar_event",
                "description": "Create a new event on the business's Google Calendar. Returns confirmation with event details and a link.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string", "description": "Title of the event (e.g. 'Meeting with John')" },
                        "date": { "type": "string", "description": "Date of the event in YYYY-MM-DD format" },
                        "start_time": { "type": "string", "description": "Start time in HH:MM format (24-hour, e.g. '14:00')" },
                        "end_time": { "type": "string", "description": "End time in HH:MM format (24-hour, e.g. '15:00')" },
                        "description": { "type": "string", "description": "Optional description or notes for the event" }
                    },
                    "required": ["summary", "date", "start_time", "end_time"]
                }
            }),
        }
    }
}

/// Tool catalog assembled per call from the agent's enabled providers.
pub struct ToolCatalog {
    tools: Vec<Tool>,
    calendar: Option<CalendarSettings>,
}

impl ToolCatalog {
    pub fn for_agent(snapshot: &AgentConfigSnapshot) -> Self {
        let mut tools = vec![Tool::SearchKnowledgeBase, Tool::EndCall];
        if snapshot.calendar.is_some() {
            tools.push(Tool::CheckCalendar);
            tools.push(Tool::CreateCalendarEvent);
        }
        Self {
            tools,
            calendar: snapshot.calendar.clone(),
        }
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.tools.iter().copied().map(Tool::definition).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().copied().map(Tool::name).collect()
    }

    pub fn calendar_settings(&self) -> Option<&CalendarSettings> {
        self.calendar.as_ref()
    }

    fn resolve(&self, name: &str) -> Option<Tool> {
        self.tools.iter().copied().find(|t| t.name() == name)
    }
}

/// Result of dispatching one function call.
pub enum ToolOutcome {
    /// A result was produced; the Orchestrator sends it and, if `rearm`,
    /// follows with `response.create` so the model keeps talking.
    Answered { output: Value, rearm: bool },
    /// `end_call` ran its grace wait; the Orchestrator now owns tearing the
    /// links down and finalizing the Call row.
    EndCallRequested { reason: String, output: Value },
}

pub struct DispatchContext<'a> {
    pub agent_id: i64,
    pub business_id: i64,
    pub catalog: &'a ToolCatalog,
    pub knowledge_base: &'a KnowledgeBaseClient,
    pub calendar: &'a CalendarClient,
    /// Goodbye grace `end_call` waits out before the Orchestrator tears the
    /// links down, per spec.md §4.5. Configurable rather than fixed so an
    /// operator can trade a cleaner goodbye against a faster hangup.
    pub end_call_grace: Duration,
}

/// Parse arguments, route to the named tool, and produce a result. Argument
/// parse failures and unknown function names are contained here as `{error}`
/// payloads — never a panic, never a torn-down call.
pub async fn dispatch(name: &str, arguments: &str, ctx: &DispatchContext<'_>) -> ToolOutcome {
    let Some(tool) = ctx.catalog.resolve(name) else {
        tracing::warn!(name, "Unknown function call requested");
        return ToolOutcome::Answered {
            output: json!({ "error": format!("Unknown function: {name}") }),
            rearm: true,
        };
    };

    let args: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(name, "Failed to parse function arguments: {e}");
            return ToolOutcome::Answered {
                output: json!({ "error": format!("invalid arguments: {e}") }),
                rearm: true,
            };
        }
    };

    match tool {
        Tool::SearchKnowledgeBase => {
            let query = args.get("query").and_then(Value::as_str).unwrap_or("");
            let output = ctx.knowledge_base.search(ctx.agent_id, query).await;
            ToolOutcome::Answered { output, rearm: true }
        }
        Tool::CheckCalendar => {
            let date = args.get("date").and_then(Value::as_str).unwrap_or("");
            let output = ctx.calendar.check_availability(ctx.business_id, date).await;
            ToolOutcome::Answered { output, rearm: true }
        }
        Tool::CreateCalendarEvent => {
            let settings = ctx.catalog.calendar_settings().cloned().unwrap_or_default();
            let output =
                calendar::create_event_with_validation(ctx.calendar, ctx.business_id, &settings, &args).await;
            ToolOutcome::Answered { output, rearm: true }
        }
        Tool::EndCall => {
            let reason = args
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Conversation completed")
                .to_string();
            tracing::info!(reason = %reason, "end_call requested, waiting on goodbye grace");
            tokio::time::sleep(ctx.end_call_grace).await;
            ToolOutcome::EndCallRequested {
                output: json!({ "success": true, "message": format!("Call ended successfully. Reason: {reason}") }),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BusinessContext;

    fn snapshot_with_calendar() -> AgentConfigSnapshot {
        AgentConfigSnapshot {
            agent_id: 1,
            business_id: 1,
            model: "gpt-realtime-1.5".to_string(),
            voice: "ash".to_string(),
            base_prompt: String::new(),
            greeting: "Hi".to_string(),
            goodbye: "Bye".to_string(),
            business: BusinessContext::default(),
            agent_phone: None,
            calendar: Some(CalendarSettings::default()),
        }
    }

    #[test]
    fn catalog_without_calendar_omits_calendar_tools() {
        let mut snapshot = snapshot_with_calendar();
        snapshot.calendar = None;
        let catalog = ToolCatalog::for_agent(&snapshot);
        assert_eq!(catalog.names(), vec!["search_knowledge_base", "end_call"]);
    }

    #[test]
    fn catalog_with_calendar_includes_both_calendar_tools() {
        let catalog = ToolCatalog::for_agent(&snapshot_with_calendar());
        assert_eq!(
            catalog.names(),
            vec![
                "search_knowledge_base",
                "end_call",
                "check_calendar",
                "create_calendar_event"
            ]
        );
    }

    #[test]
    fn unresolvable_name_returns_none() {
        let catalog = ToolCatalog::for_agent(&snapshot_with_calendar());
        assert!(catalog.resolve("delete_database").is_none());
    }

    #[tokio::test]
    async fn unknown_function_name_is_contained_not_fatal() {
        let snapshot = snapshot_with_calendar();
        let catalog = ToolCatalog::for_agent(&snapshot);
        let kb = KnowledgeBaseClient::new("http://localhost:1");
        let cal = CalendarClient::new("http://localhost:1", "token");
        let ctx = DispatchContext {
            agent_id: 1,
            business_id: 1,
            catalog: &catalog,
            knowledge_base: &kb,
            calendar: &cal,
            end_call_grace: Duration::from_millis(0),
        };

        match dispatch("delete_database", "{}", &ctx).await {
            ToolOutcome::Answered { output, rearm } => {
                assert!(output["error"].as_str().unwrap().contains("Unknown function"));
                assert!(rearm);
            }
            ToolOutcome::EndCallRequested { .. } => panic!("unexpected end_call outcome"),
        }
    }

    #[tokio::test]
    async fn malformed_arguments_are_contained_not_fatal() {
        let snapshot = snapshot_with_calendar();
        let catalog = ToolCatalog::for_agent(&snapshot);
        let kb = KnowledgeBaseClient::new("http://localhost:1");
        let cal = CalendarClient::new("http://localhost:1", "token");
        let ctx = DispatchContext {
            agent_id: 1,
            business_id: 1,
            catalog: &catalog,
            knowledge_base: &kb,
            calendar: &cal,
            end_call_grace: Duration::from_millis(0),
        };

        match dispatch("end_call", "not json", &ctx).await {
            ToolOutcome::Answered { output, .. } => {
                assert!(output["error"].as_str().unwrap().contains("invalid arguments"));
            }
            ToolOutcome::EndCallRequested { .. } => panic!("unexpected end_call outcome"),
        }
    }
}
