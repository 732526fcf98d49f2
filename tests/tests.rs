use std::sync::Arc;

use veilrun::llm::ScriptedGateway;
use veilrun::player::PlayerSession;
use veilrun::settings::Settings;
use veilrun::stats::StatsLedger;
use veilrun::storage::MemoryStorage;
use veilrun::world::demo_world;

fn offline_settings() -> Settings {
    let mut settings = Settings::new();
    settings.nlp_command_interpretation_enabled = false;
    settings
}

fn session(gateway: &Arc<ScriptedGateway>, settings: Settings) -> PlayerSession {
    PlayerSession::load(
        "tester",
        Arc::new(demo_world()),
        Arc::clone(gateway) as Arc<dyn veilrun::llm::TextGenerator>,
        Arc::new(StatsLedger::new()),
        Arc::new(MemoryStorage::new()),
        settings,
    )
    .expect("fresh player loads")
}

#[tokio::test]
async fn first_contact_lands_on_the_wise_guide() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "The records remember you, Seeker.".to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    let outcome = player.process("hello", true).await;

    assert_eq!(outcome.credits, 220);
    assert_eq!(outcome.current_area.as_deref(), Some("Sanctum"));
    assert_eq!(outcome.current_npc_name.as_deref(), Some("Elowen"));
    assert_eq!(outcome.npc_response, "The records remember you, Seeker.");
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.starts_with("Welcome, Seeker"))
    );
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("Elowen greets you"))
    );
}

#[tokio::test]
async fn free_text_movement_is_inferred_and_executed() {
    // One entry is the classifier verdict, one feeds the discarded
    // speculative dialogue (either task may pop either entry; both
    // resolve to the same command), one answers the profile distillation
    // for the new NPC's prompt.
    let gateway = Arc::new(ScriptedGateway::new(vec![
        r#"{"is_command": true, "inferred_command": "/go Tavern", "confidence": 0.95, "reasoning": "movement"}"#
            .to_string(),
        "voglio andare alla taverna".to_string(),
        "A wary newcomer, polite enough.".to_string(),
    ]));
    let mut player = session(&gateway, Settings::new());

    let outcome = player.process("voglio andare alla taverna", true).await;

    assert_eq!(outcome.current_area.as_deref(), Some("Tavern"));
    assert_eq!(outcome.current_npc_name.as_deref(), Some("Garin"));
    assert!(outcome.npc_response.is_empty());
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("interpreted as /go Tavern"))
    );
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m == "You arrive in the Tavern.")
    );
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("Garin greets you"))
    );
}

#[tokio::test]
async fn giving_the_needed_object_completes_the_quest() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "A wary newcomer, polite enough.".to_string(),
        "The coin! Veil be kind, you found it.".to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    player.process("/go Tavern", true).await;
    player.inventory.push("rare coin".to_string());

    let outcome = player.process("/give rare coin", true).await;

    assert_eq!(outcome.npc_response, "The coin! Veil be kind, you found it.");
    assert!(outcome.inventory.is_empty());
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m == "[GAME] Garin received the needed object: rare coin!")
    );
    let echoed = player
        .chat
        .as_ref()
        .and_then(|s| {
            s.messages
                .iter()
                .rev()
                .find(|m| m.role == veilrun::message::Role::User)
        })
        .map(|m| m.content.clone());
    assert_eq!(echoed.as_deref(), Some("You hand rare coin to Garin."));
}

#[tokio::test]
async fn structured_grants_move_items_and_credits() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "Ecco qui.\n[GIVEN_ITEMS: Healing Potion, -25 Credits]".to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());
    player.state.credits = 100;

    let outcome = player.process("can you patch me up?", true).await;

    assert_eq!(outcome.npc_response, "Ecco qui.");
    assert_eq!(outcome.credits, 75);
    assert_eq!(outcome.inventory, vec!["healing potion".to_string()]);
}

#[tokio::test]
async fn unaffordable_deduction_is_refused_without_mutation() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "Pay the toll. [GIVEN_ITEMS: -999 Credits]".to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    let outcome = player.process("let me pass", true).await;

    assert_eq!(outcome.npc_response, "Pay the toll.");
    assert_eq!(outcome.credits, 220);
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("You cannot cover 999 credits"))
    );
}

#[tokio::test]
async fn repeated_directive_tags_never_reach_the_player() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "Take both. [GIVEN_ITEMS: old rope] wait, [notecard=A|a] and \
         [GIVEN_ITEMS: 5 credits] plus [notecard=B|b]"
            .to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    let outcome = player.process("hand them over", true).await;

    assert!(!outcome.npc_response.contains("[GIVEN_ITEMS:"));
    assert!(!outcome.npc_response.contains("[notecard="));
    assert!(outcome.npc_response.contains("Take both."));
    // Later grant tag wins; the earlier one is swallowed whole.
    assert_eq!(outcome.credits, 225);
    assert!(outcome.inventory.is_empty());
    // First notecard wins and travels on the world-client channel only.
    let directive = outcome.world_directive.expect("notecard directive");
    assert!(directive.contains("notecard=A|a"));
    assert!(!directive.contains("notecard=B"));
    let stored = player
        .chat
        .as_ref()
        .and_then(|s| s.last_assistant_text())
        .expect("assistant reply stored");
    assert!(!stored.contains("[GIVEN_ITEMS:"));
    assert!(!stored.contains("[notecard="));
}

#[tokio::test]
async fn confidence_exactly_at_threshold_counts_as_command() {
    // Threshold raised to match the rule fallback's 0.9, so whichever
    // entry the classifier pops it lands exactly on the gate. Moving to
    // the Tavern proves the gate is inclusive.
    let gateway = Arc::new(ScriptedGateway::new(vec![
        r#"{"is_command": true, "inferred_command": "/go Tavern", "confidence": 0.9, "reasoning": "movement"}"#
            .to_string(),
        "voglio andare alla taverna".to_string(),
        "A wary newcomer, polite enough.".to_string(),
    ]));
    let mut settings = Settings::new();
    settings.nlp_command_confidence_threshold = 0.9;
    let mut player = session(&gateway, settings);

    let outcome = player.process("voglio andare alla taverna", true).await;

    assert_eq!(outcome.current_area.as_deref(), Some("Tavern"));
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("interpreted as /go Tavern"))
    );
}

#[tokio::test]
async fn hint_consultation_stashes_and_restores_the_conversation() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "A wary newcomer, polite enough.".to_string(),
        "Lost my coin to a Seeker, if you must know.".to_string(),
        "Seek beneath the lantern; Garin guards more than ale.".to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    player.process("/go Tavern", true).await;
    let outcome = player.process("what troubles you?", true).await;
    assert_eq!(
        outcome.npc_response,
        "Lost my coin to a Seeker, if you must know."
    );

    let outcome = player.process("/hint", true).await;
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m.contains("consult Elowen"))
    );

    let outcome = player.process("where is the coin?", true).await;
    assert_eq!(outcome.current_npc_name.as_deref(), Some("Elowen"));
    assert_eq!(
        outcome.npc_response,
        "Seek beneath the lantern; Garin guards more than ale."
    );

    let outcome = player.process("/endhint", true).await;
    assert_eq!(outcome.current_npc_name.as_deref(), Some("Garin"));
    assert!(
        outcome
            .system_messages
            .iter()
            .any(|m| m == "You return to Garin.")
    );
    // The stashed transcript came back untouched by the consultation.
    assert_eq!(
        player.chat.as_ref().unwrap().last_assistant_text(),
        Some("Lost my coin to a Seeker, if you must know.")
    );
}

#[tokio::test]
async fn empty_reply_becomes_a_marked_placeholder() {
    let gateway = Arc::new(ScriptedGateway::new(vec![]));
    let mut player = session(&gateway, offline_settings());

    let outcome = player.process("hello?", true).await;

    assert!(outcome.npc_response.contains("Elowen seems to ponder"));
    assert_eq!(outcome.credits, 220);
}

#[tokio::test]
async fn background_profile_update_lands_before_close() {
    let gateway = Arc::new(ScriptedGateway::new(vec![
        "You ask the right questions.".to_string(),
        r#"{"trait_adjustments": {"curiosity": "+1"}, "new_key_experiences_tags": ["asked_about_the_veil"]}"#
            .to_string(),
    ]));
    let mut player = session(&gateway, offline_settings());

    let outcome = player.process("what lies beyond the veil?", false).await;
    assert_eq!(outcome.npc_response, "You ask the right questions.");

    player.close().await.expect("close joins the updater");

    let profile = player.profile_snapshot();
    assert_eq!(profile.core_traits["curiosity"], 6.0);
    assert!(
        profile
            .key_experiences_tags
            .contains(&"asked_about_the_veil".to_string())
    );
}
