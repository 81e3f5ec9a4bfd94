// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message templates and reply parsing for the intervention flow.

/// Template text by name. `{name}` is replaced with the participant's name.
pub fn template(name: &str) -> Option<&'static str> {
    let text = match name {
        "orientation" => {
            "Hi{name}! Welcome to your daily check-ins. Each day we'll send you a \
             short activity at your scheduled time. Reply READY any time to start early."
        }
        "commitment_prompt" => {
            "Hi{name}, ready for today's short activity?\n1. 🚀 Let's do it!\n2. ⏳ Not yet"
        }
        "feeling_prompt" => "How are you feeling right now? Reply with a number from 1 (not great) to 5 (great).",
        "intervention_immediate" => {
            "Take one slow breath, then stand up and stretch for thirty seconds. \
             Reply DONE when you have finished."
        }
        "intervention_reflective" => {
            "Take a moment to think of one thing that went well today and what made it \
             possible. Reply DONE when you have finished."
        }
        "reinforcement" => "Nice work! Small steps like this add up. See you tomorrow.",
        "did_you_get_a_chance" => "Did you get a chance to try the activity?\n1. Yes\n2. No",
        "context_question" => {
            "Where were you when you tried it?\n1. Home\n2. Work\n3. Outside\n4. Somewhere else"
        }
        "mood_question" => "How did it leave you feeling?\n1. Better\n2. About the same\n3. Worse",
        "barrier_check" => "Was there anything that made it harder? Reply with a few words.",
        "barrier_reason" => "What got in the way today? Reply with a few words.",
        "ignored_path" => "No worries, we'll try again tomorrow.",
        "end_of_day" => "Thanks for checking in. Talk tomorrow!",
        "not_today" => "No problem. We'll check in again tomorrow.",
        "all_set" => "You're all set for today. Reply READY if you'd like another activity.",
        "invalid_choice" => "Sorry, I didn't catch that. Please reply with one of the options above.",
        "weekly_summary" => "This week you completed {count} activities. Keep it going!",
        _ => return None,
    };
    Some(text)
}

/// Render a template for a participant. Unknown templates render empty.
pub fn render(name: &str, participant_name: Option<&str>) -> String {
    let greeting = participant_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| format!(" {n}"))
        .unwrap_or_default();
    template(name)
        .unwrap_or_default()
        .replace("{name}", &greeting)
}

/// Weekly summary text.
pub fn weekly_summary(completed: u32) -> String {
    render("weekly_summary", None).replace("{count}", &completed.to_string())
}

/// System prompt for personalised intervention text.
pub const GENERATOR_SYSTEM_PROMPT: &str = "You write short, warm text messages for a daily \
    wellbeing program. Keep each message under 320 characters, plain text, no emojis.";

/// User prompt asking the generator to adapt an intervention.
pub fn generator_prompt(base: &str, participant_name: Option<&str>, feeling: &str) -> String {
    format!(
        "Adapt this activity for {}, whose feeling check-in was '{feeling}'. \
         Keep the instruction to reply DONE.\n\n{base}",
        participant_name.unwrap_or("the participant")
    )
}

/// Normalise a reply: lowercase, with surrounding punctuation, symbols and
/// emoji removed, so a tapped choice label matches its plain text.
pub fn canonicalize(body: &str) -> String {
    body.trim_matches(|c: char| !c.is_alphanumeric())
        .replace('\u{2019}', "'")
        .to_lowercase()
}

/// READY shortcut.
pub fn is_ready(reply: &str) -> bool {
    reply == "ready"
}

/// Commitment choice: `Some(true)` to start, `Some(false)` to skip.
pub fn parse_commitment(reply: &str) -> Option<bool> {
    match reply {
        "1" | "let's do it" | "lets do it" | "yes" => Some(true),
        "2" | "not yet" | "no" => Some(false),
        _ => None,
    }
}

/// Feeling rating 1-5, or `on_demand` for READY.
pub fn parse_feeling(reply: &str) -> Option<String> {
    if is_ready(reply) {
        return Some("on_demand".to_string());
    }
    parse_choice(reply, 5).map(|n| n.to_string())
}

/// Completion reply after an intervention: `Some(true)` for done.
pub fn parse_completion(reply: &str) -> Option<bool> {
    match reply {
        "done" | "did it" | "finished" => Some(true),
        "no" | "not yet" | "skip" => Some(false),
        _ => None,
    }
}

/// Yes/no question answered by number or word.
pub fn parse_yes_no(reply: &str) -> Option<bool> {
    match reply {
        "1" | "yes" | "y" => Some(true),
        "2" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Numbered choice in `1..=max`.
pub fn parse_choice(reply: &str, max: u8) -> Option<u8> {
    reply.parse::<u8>().ok().filter(|n| (1..=max).contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("  Ready!! "), "ready");
        assert_eq!(canonicalize("Let’s do it."), "let's do it");
        assert_eq!(canonicalize("-- 3 --"), "3");
        assert_eq!(canonicalize("🚀 Let's do it!"), "let's do it");
        assert_eq!(canonicalize("⏳ Not yet"), "not yet");
        assert_eq!(canonicalize("✅\u{fe0f} Done"), "done");
        assert_eq!(canonicalize("🚀"), "");
    }

    #[test]
    fn test_parsers() {
        assert_eq!(parse_commitment("1"), Some(true));
        assert_eq!(parse_commitment("not yet"), Some(false));
        assert_eq!(parse_commitment("maybe"), None);
        for (label, expected) in [
            ("🚀 Let's do it!", Some(true)),
            ("🚀 let’s do it", Some(true)),
            ("⏳ Not yet", Some(false)),
            ("⏳", None),
        ] {
            assert_eq!(parse_commitment(&canonicalize(label)), expected, "{label}");
        }
        assert_eq!(parse_feeling("ready").as_deref(), Some("on_demand"));
        assert_eq!(parse_feeling("5").as_deref(), Some("5"));
        assert_eq!(parse_feeling("6"), None);
        assert_eq!(parse_choice("0", 4), None);
        assert_eq!(parse_yes_no("2"), Some(false));
    }

    #[test]
    fn test_render() {
        assert!(render("commitment_prompt", Some("Ana")).starts_with("Hi Ana,"));
        assert!(render("commitment_prompt", None).starts_with("Hi,"));
        assert_eq!(weekly_summary(3), "This week you completed 3 activities. Keep it going!");
        assert_eq!(render("nope", None), "");
    }
}
