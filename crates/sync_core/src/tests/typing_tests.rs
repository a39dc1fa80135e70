use super::*;

const TIMEOUT: Duration = Duration::from_secs(3);

fn conversation() -> ConversationId {
    ConversationId::from("c1")
}

#[test]
fn typing_event_arms_indicator_until_deadline() {
    let mut typing = TypingTracker::new(TIMEOUT);
    let start = Instant::now();
    let timer = typing.typing(conversation(), UserId::from("u2"), start);

    assert_eq!(timer.deadline, start + TIMEOUT);
    assert_eq!(
        typing.state(&conversation(), start + TIMEOUT - Duration::from_millis(1)),
        TypingState::Typing {
            user_id: UserId::from("u2")
        }
    );
    assert_eq!(typing.state(&conversation(), start + TIMEOUT), TypingState::Idle);
}

#[test]
fn expiry_clears_only_matching_generation() {
    let mut typing = TypingTracker::new(TIMEOUT);
    let start = Instant::now();
    let first = typing.typing(conversation(), UserId::from("u2"), start);
    let second = typing.typing(
        conversation(),
        UserId::from("u2"),
        start + Duration::from_secs(2),
    );

    assert!(second.generation > first.generation);
    assert!(!typing.expire(&conversation(), first.generation));
    assert!(typing
        .typing_user(&conversation(), start + Duration::from_secs(4))
        .is_some());
    assert!(typing.expire(&conversation(), second.generation));
    assert_eq!(typing.typing_user(&conversation(), start), None);
}

#[test]
fn stop_typing_from_other_user_is_ignored() {
    let mut typing = TypingTracker::new(TIMEOUT);
    let now = Instant::now();
    typing.typing(conversation(), UserId::from("u2"), now);

    assert!(!typing.stop_typing(&conversation(), &UserId::from("u3")));
    assert!(typing.stop_typing(&conversation(), &UserId::from("u2")));
    assert_eq!(typing.state(&conversation(), now), TypingState::Idle);
}

#[test]
fn conversations_are_tracked_independently() {
    let mut typing = TypingTracker::new(TIMEOUT);
    let now = Instant::now();
    typing.typing(conversation(), UserId::from("u2"), now);
    typing.typing(ConversationId::from("c2"), UserId::from("u3"), now);
    typing.stop_typing(&conversation(), &UserId::from("u2"));

    assert_eq!(typing.typing_user(&conversation(), now), None);
    assert_eq!(
        typing.typing_user(&ConversationId::from("c2"), now),
        Some(UserId::from("u3"))
    );
}

#[test]
fn fresh_typing_event_clears_staleness() {
    let mut typing = TypingTracker::new(TIMEOUT);
    typing.mark_stale();
    assert!(typing.is_stale());
    typing.typing(conversation(), UserId::from("u2"), Instant::now());
    assert!(!typing.is_stale());
}
