//! 处理器解析（HandlerResolver）
//!
//! 消费消息时按处理器标识解析实例。解析失败（未注册）由调用方跳过，
//! 因此解析器只需返回 `Option`，无需区分错误原因。
//!
use super::handler::HandlerId;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

/// 类型擦除后的处理器实例
pub type AnyHandler = Arc<dyn Any + Send + Sync>;

type HandlerFactory = Arc<dyn Fn() -> AnyHandler + Send + Sync>;

/// 处理器解析器：给定处理器标识，返回实例或 `None`
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, handler_id: &HandlerId) -> Option<AnyHandler>;
}

/// 基于内存的处理器注册表
/// - 以处理器类型为键，支持单例实例与每次解析新建的工厂两种方式；
/// - 重复注册同一类型时覆盖旧条目。
#[derive(Default)]
pub struct HandlerRegistry {
    factories: DashMap<HandlerId, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册单例处理器，每次解析返回同一实例
    pub fn register_instance<H>(&self, handler: Arc<H>)
    where
        H: Send + Sync + 'static,
    {
        let f: HandlerFactory = Arc::new(move || handler.clone() as AnyHandler);
        self.factories.insert(HandlerId::of::<H>(), f);
    }

    /// 注册处理器工厂，每次解析调用一次工厂
    pub fn register_factory<H, F>(&self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let f: HandlerFactory = Arc::new(move || Arc::new(factory()) as AnyHandler);
        self.factories.insert(HandlerId::of::<H>(), f);
    }

    pub fn unregister<H: 'static>(&self) -> bool {
        self.factories.remove(&HandlerId::of::<H>()).is_some()
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&HandlerId::of::<H>())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, handler_id: &HandlerId) -> Option<AnyHandler> {
        // 先克隆工厂再调用，避免工厂内部再次访问注册表时持有分片锁
        let factory = self.factories.get(handler_id).map(|f| f.value().clone())?;
        Some(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        n: usize,
    }

    #[test]
    fn instance_is_shared_between_resolutions() {
        let registry = HandlerRegistry::new();
        registry.register_instance(Arc::new(Counter { n: 1 }));

        let id = HandlerId::of::<Counter>();
        let a = registry.resolve(&id).unwrap().downcast::<Counter>().ok().unwrap();
        let b = registry.resolve(&id).unwrap().downcast::<Counter>().ok().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.n, 1);
    }

    #[test]
    fn factory_runs_per_resolution() {
        let registry = HandlerRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        registry.register_factory(move || Counter {
            n: c.fetch_add(1, Ordering::SeqCst) + 1,
        });

        let id = HandlerId::of::<Counter>();
        let first = registry.resolve(&id).unwrap().downcast::<Counter>().ok().unwrap();
        let second = registry.resolve(&id).unwrap().downcast::<Counter>().ok().unwrap();
        assert_eq!(first.n, 1);
        assert_eq!(second.n, 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_handler_resolves_to_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.resolve(&HandlerId::of::<Counter>()).is_none());

        registry.register_instance(Arc::new(Counter { n: 0 }));
        assert!(registry.contains::<Counter>());
        assert!(registry.unregister::<Counter>());
        assert!(registry.resolve(&HandlerId::of::<Counter>()).is_none());
        assert_eq!(registry.len(), 0);
    }
}
