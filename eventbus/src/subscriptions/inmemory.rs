use super::{EventRemovedListener, EventTypeDescriptor, SubscriptionInfo, SubscriptionsManager};
use crate::abstractions::HandlerId;
use crate::error::{EventBusError, EventBusResult as Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Default)]
struct State {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    event_types: HashMap<String, EventTypeDescriptor>,
    listeners: Vec<EventRemovedListener>,
}

/// 基于内存的订阅注册表
/// - 单把互斥锁保护订阅表、事件类型目录与监听器；
/// - 监听器在释放锁之后调用，可在回调中再次访问注册表。
#[derive(Default)]
pub struct InMemorySubscriptionsManager {
    state: Mutex<State>,
}

impl InMemorySubscriptionsManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SubscriptionsManager for InMemorySubscriptionsManager {
    fn add_subscription(
        &self,
        event_name: &str,
        subscription: SubscriptionInfo,
        event_type: Option<EventTypeDescriptor>,
    ) -> Result<()> {
        if !subscription.is_dynamic() && event_type.is_none() {
            return Err(EventBusError::UnknownEventType {
                event_name: event_name.to_string(),
            });
        }

        let mut state = self.state();

        if let Some(list) = state.handlers.get(event_name) {
            if list
                .iter()
                .any(|s| s.handler_id() == subscription.handler_id())
            {
                return Err(EventBusError::DuplicateHandler {
                    handler: subscription.handler_id().to_string(),
                    event_name: event_name.to_string(),
                });
            }
        }

        // 同一事件名只能对应一个具体事件类型
        if let (Some(incoming), Some(known)) = (&event_type, state.event_types.get(event_name)) {
            if incoming != known {
                return Err(EventBusError::TypeMismatch {
                    expected: known.type_name().to_string(),
                    found: incoming.type_name().to_string(),
                });
            }
        }

        debug!(
            event_name,
            handler = %subscription.handler_id(),
            dynamic = subscription.is_dynamic(),
            "subscription added"
        );

        state
            .handlers
            .entry(event_name.to_string())
            .or_default()
            .push(subscription);

        if let Some(descriptor) = event_type {
            state
                .event_types
                .entry(event_name.to_string())
                .or_insert(descriptor);
        }

        Ok(())
    }

    fn remove_subscription(&self, event_name: &str, handler_id: &HandlerId) -> bool {
        let listeners = {
            let mut state = self.state();

            let Some(list) = state.handlers.get_mut(event_name) else {
                return false;
            };
            let Some(pos) = list.iter().position(|s| s.handler_id() == handler_id) else {
                return false;
            };

            list.remove(pos);
            debug!(event_name, handler = %handler_id, "subscription removed");

            if !list.is_empty() {
                return true;
            }

            state.handlers.remove(event_name);
            state.event_types.remove(event_name);
            state.listeners.clone()
        };

        debug!(event_name, "event removed from subscriptions");
        for listener in listeners {
            listener(event_name);
        }

        true
    }

    fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.state().handlers.contains_key(event_name)
    }

    fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.state()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    fn event_type_by_name(&self, event_name: &str) -> Option<EventTypeDescriptor> {
        self.state().event_types.get(event_name).copied()
    }

    fn is_empty(&self) -> bool {
        self.state().handlers.is_empty()
    }

    fn clear(&self) {
        let mut state = self.state();
        state.handlers.clear();
        state.event_types.clear();
    }

    fn on_event_removed(&self, listener: EventRemovedListener) {
        self.state().listeners.push(listener);
    }
}
