use super::{HandlerKey, HandlerResolver, HandlerScope};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

#[derive(Clone)]
enum Registration {
    /// 全局共享的单例
    Singleton(Instance),
    /// 每个作用域创建一次
    Scoped(Factory),
}

/// 内置的处理器容器
///
/// ```ignore
/// let mut container = HandlerContainer::new();
/// container.register_instance(Arc::new(AuditHandler::default()));
/// container.register_factory(|| MailHandler::new(smtp.clone()));
/// ```
#[derive(Clone, Default)]
pub struct HandlerContainer {
    registrations: HashMap<TypeId, Registration>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册单例处理器，所有消息共享同一实例
    pub fn register_instance<H>(&mut self, handler: Arc<H>) -> &mut Self
    where
        H: Send + Sync + 'static,
    {
        self.registrations
            .insert(TypeId::of::<H>(), Registration::Singleton(handler));
        self
    }

    /// 注册作用域处理器：每条消息在首次解析时通过工厂创建一次
    pub fn register_factory<H, F>(&mut self, factory: F) -> &mut Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Instance);
        self.registrations
            .insert(TypeId::of::<H>(), Registration::Scoped(factory));
        self
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.registrations.contains_key(&key.type_id())
    }
}

impl HandlerResolver for HandlerContainer {
    fn begin_scope(&self) -> Box<dyn HandlerScope + '_> {
        Box::new(ContainerScope {
            registrations: &self.registrations,
            resolved: Mutex::new(HashMap::new()),
        })
    }
}

struct ContainerScope<'a> {
    registrations: &'a HashMap<TypeId, Registration>,
    resolved: Mutex<HashMap<TypeId, Instance>>,
}

impl HandlerScope for ContainerScope<'_> {
    fn resolve(&self, key: &HandlerKey) -> Option<Instance> {
        match self.registrations.get(&key.type_id())? {
            Registration::Singleton(instance) => Some(instance.clone()),
            Registration::Scoped(factory) => {
                let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
                let instance = resolved
                    .entry(key.type_id())
                    .or_insert_with(|| factory())
                    .clone();
                Some(instance)
            }
        }
    }
}
