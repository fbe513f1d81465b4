//! Builds the Realtime session's instruction blob from a typed context
//! struct, section by section, mirroring `original_source`'s
//! `_configure_session` string assembly.

use crate::dispatch::ToolCatalog;
use crate::store::AgentConfigSnapshot;

const DEFAULT_PROMPT: &str = "You are a helpful AI voice assistant.\n\
Answer questions using only the uploaded knowledge base documents.\n\
Always be polite, professional, and helpful.";

pub fn build(snapshot: &AgentConfigSnapshot, catalog: &ToolCatalog) -> String {
    let business_name = snapshot.business.name.as_deref().unwrap_or("a business");
    let business_context = business_context_lines(snapshot);
    let tool_names = catalog.names();
    let tool_list = tool_names.join(", ");
    let tool_instructions = tool_instructions(snapshot, &tool_names);
    let base_instructions = if snapshot.base_prompt.trim().is_empty() {
        DEFAULT_PROMPT
    } else {
        snapshot.base_prompt.as_str()
    };

    format!(
        "# Role & Objective\n\
You are a voice customer service agent for {business_name}. Help callers by answering questions using ONLY the uploaded knowledge base documents.\n\
\n\
# Context\n\
{business_context}\n\
You represent this business. When asked who you are, what business this is, or for contact details, use the information above.\n\
\n\
# Capabilities\n\
You have access to the following tools: {tool_list}.\n\
You can ONLY perform actions that your tools allow. If a caller asks you to do something outside your capabilities, let them know what you can help with instead.\n\
\n\
# Personality & Tone\n\
## Personality\n\
Professional, friendly, calm, and approachable customer service assistant.\n\
\n\
## Tone\n\
Warm, concise, confident, never fawning.\n\
\n\
## Length\n\
2-3 sentences per turn.\n\
\n\
## Language\n\
- The conversation will be only in English.\n\
- Do not respond in any other language even if the user asks.\n\
- If the user speaks another language, politely explain that support is limited to English.\n\
\n\
## Variety\n\
- Do not repeat the same sentence twice. Vary your responses so it doesn't sound robotic.\n\
\n\
# Initial Greeting\n\
When you see \"[Call connected]\", say exactly: \"{greeting}\"\n\
- Say this once, then wait for the caller.\n\
- NEVER repeat the greeting later in the conversation.\n\
\n\
# Unclear Audio\n\
- Only respond to clear audio or text.\n\
- If the user's audio is not clear (e.g., ambiguous input, background noise, silent, unintelligible) or if you did not fully hear or understand the user, ask for clarification.\n\
- Do not include any sound effects or onomatopoeic expressions in your responses.\n\
\n\
Sample clarification phrases:\n\
- \"Sorry, I didn't catch that - could you say it again?\"\n\
- \"There's some background noise. Please repeat the last part.\"\n\
- \"I only heard part of that. What did you say after...?\"\n\
\n\
# Tools\n\
{tool_instructions}\n\
\n\
# Instructions\n\
- NEVER answer factual questions without calling search_knowledge_base first.\n\
- Keep responses concise - this is a phone call, not an essay.\n\
- If you don't know, say so. Do not make up answers.\n\
\n\
{base_instructions}",
        greeting = snapshot.greeting,
    )
}

fn business_context_lines(snapshot: &AgentConfigSnapshot) -> String {
    let mut lines = Vec::new();
    if let Some(name) = &snapshot.business.name {
        lines.push(format!("- Business name: {name}"));
    }
    if let Some(address) = &snapshot.business.address {
        lines.push(format!("- Address: {address}"));
    }
    if let Some(email) = &snapshot.business.business_email {
        lines.push(format!("- Contact email: {email}"));
    }
    if let Some(phone) = &snapshot.business.phone_number {
        lines.push(format!("- Business contact phone: {phone}"));
    }
    if let Some(agent_phone) = &snapshot.agent_phone {
        lines.push(format!(
            "- Your phone number (the number callers dialed): {agent_phone}"
        ));
    }
    if lines.is_empty() {
        "- No business details available.".to_string()
    } else {
        lines.join("\n")
    }
}

fn tool_instructions(snapshot: &AgentConfigSnapshot, tool_names: &[&str]) -> String {
    let mut instructions = String::from(
        "- Before any tool call, say one short line like \"Let me check that for you.\" Then call the tool immediately.",
    );

    if tool_names.contains(&"search_knowledge_base") {
        instructions.push_str(
            "\n\n## search_knowledge_base\n\
- Call BEFORE answering any factual question.\n\
- If no results, retry with different search terms (up to 3 attempts).\n\
- NEVER use your general knowledge or training data - only search results.\n\
- After 3 failed searches, say you don't have that information.",
        );
    }

    if tool_names.contains(&"end_call") {
        instructions.push_str(&format!(
            "\n\n## end_call\n\
- Call when the caller says goodbye or the conversation is complete.\n\
- BEFORE calling, say: \"{}\"",
            snapshot.goodbye
        ));
    }

    if tool_names.contains(&"check_calendar") {
        if let Some(cal) = &snapshot.calendar {
            instructions.push_str(&format!(
                "\n\n## check_calendar\n\
- Call when the caller asks about availability or wants to know when they're free/busy.\n\
- Returns busy time slots (not event details). Summarize which times are busy vs available.\n\
\n\
## create_calendar_event\n\
- Call when the caller wants to schedule, book, or create an appointment.\n\
- Confirm the details (what, when) with the caller BEFORE creating the event.\n\
- Default appointment duration: {duration} minutes (use this if caller doesn't specify).\n\
- Business hours: {start} to {end}. Do not book appointments outside these hours.\n\
- Booking window: up to {window} days in advance.\n\
- {conflict_policy}\n\
- After creating, confirm the event was added.",
                duration = cal.default_duration_minutes,
                start = cal.business_hours_start,
                end = cal.business_hours_end,
                window = cal.booking_window_days,
                conflict_policy = if cal.allow_conflicts {
                    "Conflicts are allowed."
                } else {
                    "Do not book over existing events (check calendar first)."
                },
            ));
        }
    }

    instructions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BusinessContext, CalendarSettings};

    fn snapshot() -> AgentConfigSnapshot {
        AgentConfigSnapshot {
            agent_id: 1,
            business_id: 1,
            model: "gpt-realtime-1.5".to_string(),
            voice: "ash".to_string(),
            base_prompt: String::new(),
            greeting: "Hi, Acme here.".to_string(),
            goodbye: "Goodbye!".to_string(),
            business: BusinessContext {
                name: Some("Acme".to_string()),
                address: None,
                business_email: None,
                phone_number: None,
            },
            agent_phone: Some("+15550001111".to_string()),
            calendar: None,
        }
    }

    #[test]
    fn includes_greeting_verbatim() {
        let catalog = ToolCatalog::for_agent(&snapshot());
        let instructions = build(&snapshot(), &catalog);
        assert!(instructions.contains("say exactly: \"Hi, Acme here.\""));
    }

    #[test]
    fn omits_calendar_guidance_when_not_enabled() {
        let catalog = ToolCatalog::for_agent(&snapshot());
        let instructions = build(&snapshot(), &catalog);
        assert!(!instructions.contains("## check_calendar"));
    }

    #[test]
    fn includes_calendar_guidance_with_business_hours_when_enabled() {
        let mut snap = snapshot();
        snap.calendar = Some(CalendarSettings {
            default_duration_minutes: 45,
            allow_conflicts: true,
            booking_window_days: 14,
            business_hours_start: "08:00".to_string(),
            business_hours_end: "18:00".to_string(),
        });
        let catalog = ToolCatalog::for_agent(&snap);
        let instructions = build(&snap, &catalog);
        assert!(instructions.contains("## check_calendar"));
        assert!(instructions.contains("45 minutes"));
        assert!(instructions.contains("08:00 to 18:00"));
        assert!(instructions.contains("Conflicts are allowed."));
    }

    #[test]
    fn falls_back_to_default_prompt_when_base_prompt_empty() {
        let catalog = ToolCatalog::for_agent(&snapshot());
        let instructions = build(&snapshot(), &catalog);
        assert!(instructions.contains(DEFAULT_PROMPT));
    }

    #[test]
    fn missing_business_details_fall_back_to_placeholder() {
        let mut snap = snapshot();
        snap.business = BusinessContext::default();
        snap.agent_phone = None;
        let catalog = ToolCatalog::for_agent(&snap);
        let instructions = build(&snap, &catalog);
        assert!(instructions.contains("No business details available."));
    }
}
