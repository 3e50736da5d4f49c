use eventbus::IntegrationEvent;
use eventbus_macros::integration_event;

#[integration_event]
struct UserRegistered {
    user_id: u64,
    email: String,
}

fn main() {
    let ev = UserRegistered::new(1, "a@example.com".to_string());
    assert_eq!(ev.event_name(), "UserRegistered");
    let _ = (ev.user_id, ev.email);
}
