use quorum_primitives::ServiceId;

use super::{Service, ServiceContext};

/// Owner of every live [`ServiceContext`], in registration order.
///
/// Iteration order is the order services were first materialized, which is
/// what makes the snapshot stream deterministic across replicas. Ids are
/// assigned monotonically and never reused; a name bound again after deletion
/// gets a fresh id.
pub struct ServiceRegistry {
    next_id: u64,
    services: Vec<ServiceContext>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, name: String, type_name: String, instance: Box<dyn Service>) -> ServiceId {
        let id = ServiceId(self.next_id);
        self.next_id += 1;
        self.services.push(ServiceContext::new(id, name, type_name, instance));
        id
    }

    /// Insert a service restored from a snapshot, keeping its recorded id.
    pub fn adopt(&mut self, id: ServiceId, name: String, type_name: String, instance: Box<dyn Service>) -> &mut ServiceContext {
        self.next_id = self.next_id.max(id.0 + 1);
        self.services.push(ServiceContext::new(id, name, type_name, instance));
        let end = self.services.len() - 1;
        &mut self.services[end]
    }

    pub fn unregister(&mut self, id: ServiceId) -> Option<ServiceContext> {
        let position = self.services.iter().position(|s| s.id() == id)?;
        Some(self.services.remove(position))
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceContext> {
        self.services.iter().find(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut ServiceContext> {
        self.services.iter_mut().find(|s| s.id() == id)
    }

    pub fn id_by_name(&self, name: &str) -> Option<ServiceId> {
        self.services.iter().find(|s| s.name() == name).map(|s| s.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceContext> {
        self.services.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceContext> {
        self.services.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
