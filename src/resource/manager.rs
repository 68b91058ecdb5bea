// src/resource/manager.rs

//! Capacity-aware allocation of tasks to registered ants.
//!
//! All state lives behind one `RwLock`: lookups take the read lock, every
//! mutation (registration, reserve, confirm, release, reaping) takes the
//! write lock for its whole duration so the indexes never disagree.
//!
//! The `(request, task type) -> ant` binding index is what guarantees a
//! task is never bound to two ants at once. Heartbeats refresh the bindings
//! an ant reports and drop the ones it stopped reporting; pairs released by
//! the scheduler are remembered for a reservation timeout so a late
//! heartbeat cannot bind them again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::JobDefinition;
use crate::errors::{FormicaryError, Result};
use crate::resource::registration::{AntAllocation, AntRegistration, AntReservation};
use crate::types::{RequestState, TaskMethod};

type BindingKey = (Uuid, String);

#[derive(Debug, Default)]
struct ResourceState {
    registrations: HashMap<String, AntRegistration>,
    ants_by_method: HashMap<TaskMethod, BTreeSet<String>>,
    ants_by_tag: HashMap<String, BTreeSet<String>>,
    /// ant id -> request id -> allocation
    allocations_by_ant: HashMap<String, HashMap<Uuid, AntAllocation>>,
    ants_by_request: HashMap<Uuid, BTreeSet<String>>,
    bindings: HashMap<BindingKey, String>,
    /// Pairs released by the scheduler, with the release time.
    released: HashMap<BindingKey, DateTime<Utc>>,
}

impl ResourceState {
    fn load_of(&self, ant_id: &str) -> u32 {
        self.allocations_by_ant
            .get(ant_id)
            .map(|allocs| allocs.values().map(|a| a.load() as u32).sum())
            .unwrap_or(0)
    }

    fn unindex_ant(&mut self, ant_id: &str) {
        for ants in self.ants_by_method.values_mut() {
            ants.remove(ant_id);
        }
        for ants in self.ants_by_tag.values_mut() {
            ants.remove(ant_id);
        }
        self.ants_by_method.retain(|_, ants| !ants.is_empty());
        self.ants_by_tag.retain(|_, ants| !ants.is_empty());
    }

    fn index_ant(&mut self, registration: &AntRegistration) {
        for method in &registration.methods {
            self.ants_by_method
                .entry(*method)
                .or_default()
                .insert(registration.ant_id.clone());
        }
        for tag in &registration.tags {
            self.ants_by_tag
                .entry(tag.to_lowercase())
                .or_default()
                .insert(registration.ant_id.clone());
        }
    }

    /// Ants that run `method`, carry all `tags` and are alive.
    fn candidates(
        &self,
        method: TaskMethod,
        tags: &[String],
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<Vec<&AntRegistration>> {
        let Some(method_ants) = self.ants_by_method.get(&method) else {
            return Err(FormicaryError::AntsUnavailable(format!(
                "no ants available for method '{method}', total registered ants={}",
                self.registrations.len()
            )));
        };
        for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !self.ants_by_tag.contains_key(&tag.to_lowercase()) {
                return Err(FormicaryError::AntsUnavailable(format!(
                    "no ants available for tag '{tag}', total registered ants={}",
                    self.registrations.len()
                )));
            }
        }
        Ok(method_ants
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .filter(|reg| reg.is_alive(now, liveness) && reg.supports(method, tags))
            .collect())
    }

    /// Drop one binding; returns whether anything was removed.
    fn unbind(&mut self, ant_id: &str, request_id: Uuid, task_type: &str) -> bool {
        let key = (request_id, task_type.to_string());
        if self.bindings.get(&key).is_some_and(|owner| owner == ant_id) {
            self.bindings.remove(&key);
            self.released.insert(key, Utc::now());
        }
        let Some(allocs) = self.allocations_by_ant.get_mut(ant_id) else {
            return false;
        };
        let Some(alloc) = allocs.get_mut(&request_id) else {
            return false;
        };
        let removed = alloc.task_types.remove(task_type).is_some();
        if alloc.task_types.is_empty() {
            allocs.remove(&request_id);
            if let Some(ants) = self.ants_by_request.get_mut(&request_id) {
                ants.remove(ant_id);
                if ants.is_empty() {
                    self.ants_by_request.remove(&request_id);
                }
            }
        }
        removed
    }

    /// Remove an ant with all its bindings, returned as reservations.
    fn remove_ant(&mut self, ant_id: &str) -> Vec<AntReservation> {
        let encryption_key = self
            .registrations
            .remove(ant_id)
            .and_then(|r| r.encryption_key);
        self.unindex_ant(ant_id);
        let mut released = Vec::new();
        if let Some(allocs) = self.allocations_by_ant.remove(ant_id) {
            for alloc in allocs.into_values() {
                for task_type in alloc.task_types.keys() {
                    let key = (alloc.job_request_id, task_type.clone());
                    if self.bindings.get(&key).is_some_and(|owner| owner == ant_id) {
                        self.bindings.remove(&key);
                        self.released.insert(key, Utc::now());
                    }
                    released.push(reservation_for(&alloc, task_type, encryption_key.clone()));
                }
                if let Some(ants) = self.ants_by_request.get_mut(&alloc.job_request_id) {
                    ants.remove(ant_id);
                    if ants.is_empty() {
                        self.ants_by_request.remove(&alloc.job_request_id);
                    }
                }
            }
        }
        released
    }
}

fn reservation_for(
    alloc: &AntAllocation,
    task_type: &str,
    encryption_key: Option<String>,
) -> AntReservation {
    AntReservation {
        job_request_id: alloc.job_request_id,
        task_type: task_type.to_string(),
        ant_id: alloc.ant_id.clone(),
        ant_topic: alloc.ant_topic.clone(),
        encryption_key,
        allocated_at: alloc.allocated_at,
        current_load: 0,
        total_reservations: 0,
    }
}

/// Registry of live ants and the task bindings held against them.
#[derive(Debug)]
pub struct ResourceManager {
    state: RwLock<ResourceState>,
    liveness_timeout: Duration,
    reservation_timeout: Duration,
}

impl ResourceManager {
    pub fn new(liveness_timeout: Duration, reservation_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(ResourceState::default()),
            liveness_timeout,
            reservation_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Record a heartbeat.
    ///
    /// Allocations the ant reports are merged into the allocator's view and
    /// their age is refreshed, unless the pair is bound to another ant or was
    /// released by the scheduler. Handed-over bindings the ant no longer
    /// reports, although they already existed at its previous heartbeat, are
    /// dropped.
    pub fn register(&self, mut registration: AntRegistration) -> Result<()> {
        registration.validate()?;
        let now = Utc::now();
        registration.received_at = now;
        let ant_id = registration.ant_id.clone();

        let mut state = self.state.write();
        let previous_beat = state.registrations.get(&ant_id).map(|r| r.received_at);
        state.unindex_ant(&ant_id);
        state.index_ant(&registration);

        let mut reported: HashSet<BindingKey> = HashSet::new();
        for alloc in registration.allocations.values() {
            for (task_type, task_state) in alloc.task_types.iter() {
                let key = (alloc.job_request_id, task_type.clone());
                match state.bindings.get(&key) {
                    Some(owner) if owner != &ant_id => {
                        warn!(
                            ant_id = %ant_id,
                            owner = %owner,
                            request_id = %alloc.job_request_id,
                            task_type = %task_type,
                            "ignoring reported allocation bound to another ant"
                        );
                        continue;
                    }
                    None if state.released.contains_key(&key) => {
                        debug!(
                            ant_id = %ant_id,
                            request_id = %alloc.job_request_id,
                            task_type = %task_type,
                            "ignoring reported allocation already released"
                        );
                        continue;
                    }
                    _ => {}
                }
                reported.insert(key.clone());
                state.bindings.insert(key, ant_id.clone());
                let entry = state
                    .allocations_by_ant
                    .entry(ant_id.clone())
                    .or_default()
                    .entry(alloc.job_request_id)
                    .or_insert_with(|| {
                        let mut fresh = alloc.clone();
                        fresh.task_types.clear();
                        fresh
                    });
                entry.task_types.insert(task_type.clone(), *task_state);
                entry.updated_at = now;
                state
                    .ants_by_request
                    .entry(alloc.job_request_id)
                    .or_default()
                    .insert(ant_id.clone());
            }
        }
        state.allocations_by_ant.entry(ant_id.clone()).or_default();

        if let Some(previous_beat) = previous_beat {
            let forgotten: Vec<BindingKey> = state
                .allocations_by_ant
                .get(&ant_id)
                .into_iter()
                .flat_map(|allocs| allocs.values())
                .filter(|alloc| alloc.updated_at < previous_beat)
                .flat_map(|alloc| {
                    alloc
                        .task_types
                        .iter()
                        .filter(|(_, task_state)| **task_state == RequestState::Executing)
                        .map(|(task_type, _)| (alloc.job_request_id, task_type.clone()))
                })
                .filter(|key| !reported.contains(key))
                .collect();
            for (request_id, task_type) in forgotten {
                info!(
                    ant_id = %ant_id,
                    request_id = %request_id,
                    task_type = %task_type,
                    "dropping allocation no longer reported by ant"
                );
                state.unbind(&ant_id, request_id, &task_type);
            }
        }
        let load = state.load_of(&ant_id);

        debug!(
            ant_id = %ant_id,
            methods = ?registration.methods,
            tags = ?registration.tags,
            load,
            total = state.registrations.len() + 1,
            "registered ant"
        );
        state.registrations.insert(ant_id, registration);
        Ok(())
    }

    pub fn registrations(&self) -> Vec<AntRegistration> {
        let mut regs: Vec<AntRegistration> =
            self.state.read().registrations.values().cloned().collect();
        regs.sort_by(|a, b| a.ant_id.cmp(&b.ant_id));
        regs
    }

    pub fn registration(&self, ant_id: &str) -> Option<AntRegistration> {
        self.state.read().registrations.get(ant_id).cloned()
    }

    pub fn load_of(&self, ant_id: &str) -> u32 {
        self.state.read().load_of(ant_id)
    }

    /// Ant currently bound to `(request_id, task_type)`.
    pub fn binding_of(&self, request_id: Uuid, task_type: &str) -> Option<String> {
        self.state
            .read()
            .bindings
            .get(&(request_id, task_type.to_string()))
            .cloned()
    }

    pub fn allocations_of(&self, ant_id: &str) -> Vec<AntAllocation> {
        self.state
            .read()
            .allocations_by_ant
            .get(ant_id)
            .map(|allocs| allocs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_bindings(&self) -> usize {
        self.state.read().bindings.len()
    }

    /// Check that every method and tag the job uses has at least one live
    /// ant with spare capacity. Tags are checked independently since tasks
    /// do not run at the same time.
    pub fn has_ants_for_job_tags(&self, methods: &[TaskMethod], tags: &[String]) -> Result<()> {
        if methods.is_empty() {
            return Err(FormicaryError::Validation(
                "methods not specified for ant lookup".to_string(),
            ));
        }
        let now = Utc::now();
        let state = self.state.read();
        for method in methods {
            let alive = state.ants_by_method.get(method).is_some_and(|ants| {
                ants.iter()
                    .filter_map(|id| state.registrations.get(id))
                    .any(|r| r.is_alive(now, self.liveness_timeout))
            });
            if !alive {
                return Err(FormicaryError::AntsUnavailable(format!(
                    "no ant for method '{method}'"
                )));
            }
        }
        for tag in tags {
            let Some(ants) = state.ants_by_tag.get(&tag.to_lowercase()) else {
                return Err(FormicaryError::AntsUnavailable(format!("no ant for tag '{tag}'")));
            };
            let matched = ants
                .iter()
                .filter_map(|id| state.registrations.get(id))
                .any(|r| state.load_of(&r.ant_id) < r.capacity());
            if !matched {
                return Err(FormicaryError::AntsUnavailable(format!(
                    "no ant with spare capacity for tag '{tag}'"
                )));
            }
        }
        Ok(())
    }

    /// Dry-run a reservation for every scheduler-dispatched task of `job`.
    pub fn check_job_resources(&self, job: &JobDefinition) -> Result<Vec<AntReservation>> {
        let now = Utc::now();
        let state = self.state.read();
        let mut out = Vec::new();
        for task in job.tasks().iter().filter(|t| !t.method.is_scheduler_local()) {
            let candidates = state.candidates(task.method, &task.tags, now, self.liveness_timeout)?;
            let best = candidates
                .iter()
                .min_by_key(|r| (state.load_of(&r.ant_id), r.ant_id.clone()))
                .ok_or_else(|| {
                    FormicaryError::AntsUnavailable(format!(
                        "no ants could be reserved for task '{}' method={} tags={:?}",
                        task.task_type, task.method, task.tags
                    ))
                })?;
            out.push(AntReservation {
                job_request_id: Uuid::nil(),
                task_type: task.task_type.clone(),
                ant_id: best.ant_id.clone(),
                ant_topic: best.ant_topic.clone(),
                encryption_key: best.encryption_key.clone(),
                allocated_at: now,
                current_load: state.load_of(&best.ant_id),
                total_reservations: candidates.len() as u32,
            });
        }
        out.sort_by(|a, b| a.ant_id.cmp(&b.ant_id));
        Ok(out)
    }

    /// Reserve the least-loaded live ant that supports `method` and `tags`
    /// and has spare capacity.
    ///
    /// Fails with [`FormicaryError::AlreadyAllocated`] while the pair is
    /// bound, and with the retryable [`FormicaryError::AntsUnavailable`]
    /// when no ant fits.
    pub fn reserve(
        &self,
        request_id: Uuid,
        task_type: &str,
        method: TaskMethod,
        tags: &[String],
    ) -> Result<AntReservation> {
        let now = Utc::now();
        let mut state = self.state.write();

        let key = (request_id, task_type.to_string());
        if let Some(owner) = state.bindings.get(&key) {
            return Err(FormicaryError::AlreadyAllocated(format!(
                "task '{task_type}' of request {request_id} is already bound to ant {owner}"
            )));
        }

        let candidates = state.candidates(method, tags, now, self.liveness_timeout)?;
        let pool_load: u32 = candidates.iter().map(|r| state.load_of(&r.ant_id)).sum();
        let best = candidates
            .iter()
            .filter(|r| state.load_of(&r.ant_id) < r.capacity())
            .min_by_key(|r| (state.load_of(&r.ant_id), r.ant_id.clone()))
            .map(|r| (r.ant_id.clone(), r.ant_topic.clone(), r.encryption_key.clone()));
        let Some((ant_id, ant_topic, encryption_key)) = best else {
            return Err(FormicaryError::AntsUnavailable(format!(
                "no ants could be reserved for method={method} tags={tags:?} matching={}",
                candidates.len()
            )));
        };

        let alloc = state
            .allocations_by_ant
            .entry(ant_id.clone())
            .or_default()
            .entry(request_id)
            .or_insert_with(|| AntAllocation::new(&ant_id, &ant_topic, request_id, task_type));
        alloc
            .task_types
            .insert(task_type.to_string(), RequestState::Ready);
        alloc.updated_at = now;
        state.released.remove(&key);
        state.bindings.insert(key, ant_id.clone());
        state
            .ants_by_request
            .entry(request_id)
            .or_default()
            .insert(ant_id.clone());
        let current_load = state.load_of(&ant_id);
        if let Some(reg) = state.registrations.get_mut(&ant_id) {
            reg.current_load = current_load;
        }

        let reservation = AntReservation {
            job_request_id: request_id,
            task_type: task_type.to_string(),
            ant_id,
            ant_topic,
            encryption_key,
            allocated_at: now,
            current_load,
            total_reservations: pool_load + 1,
        };
        debug!(
            request_id = %request_id,
            task_type,
            ant_id = %reservation.ant_id,
            load = current_load,
            total_reservations = reservation.total_reservations,
            "reserved ant"
        );
        Ok(reservation)
    }

    /// Mark a reservation as handed over to the ant.
    pub fn confirm(&self, reservation: &AntReservation) -> Result<()> {
        let mut state = self.state.write();
        let key = (reservation.job_request_id, reservation.task_type.clone());
        if state.bindings.get(&key) != Some(&reservation.ant_id) {
            return Err(FormicaryError::Validation(format!(
                "reservation of '{}' on ant {} is no longer held",
                reservation.task_type, reservation.ant_id
            )));
        }
        if let Some(alloc) = state
            .allocations_by_ant
            .get_mut(&reservation.ant_id)
            .and_then(|allocs| allocs.get_mut(&reservation.job_request_id))
        {
            alloc
                .task_types
                .insert(reservation.task_type.clone(), RequestState::Executing);
            alloc.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Drop a reservation or allocation. Releasing something already gone
    /// is not an error.
    pub fn release(&self, reservation: &AntReservation) -> bool {
        let mut state = self.state.write();
        let removed = state.unbind(
            &reservation.ant_id,
            reservation.job_request_id,
            &reservation.task_type,
        );
        let load = state.load_of(&reservation.ant_id);
        if let Some(reg) = state.registrations.get_mut(&reservation.ant_id) {
            reg.current_load = load;
        }
        debug!(
            request_id = %reservation.job_request_id,
            task_type = %reservation.task_type,
            ant_id = %reservation.ant_id,
            removed,
            "released ant"
        );
        removed
    }

    /// Drop every binding held for a request. Returns how many were dropped.
    pub fn release_job(&self, request_id: Uuid) -> usize {
        let mut state = self.state.write();
        let Some(ants) = state.ants_by_request.remove(&request_id) else {
            return 0;
        };
        let mut count = 0;
        for ant_id in ants {
            if let Some(alloc) = state
                .allocations_by_ant
                .get_mut(&ant_id)
                .and_then(|allocs| allocs.remove(&request_id))
            {
                count += alloc.load();
            }
            let load = state.load_of(&ant_id);
            if let Some(reg) = state.registrations.get_mut(&ant_id) {
                reg.current_load = load;
            }
        }
        let now = Utc::now();
        let dropped: Vec<BindingKey> = state
            .bindings
            .keys()
            .filter(|(req, _)| *req == request_id)
            .cloned()
            .collect();
        for key in dropped {
            state.bindings.remove(&key);
            state.released.insert(key, now);
        }
        count
    }

    /// Remove ants whose heartbeat is older than the liveness window and
    /// return their bindings for rescheduling.
    pub fn reap_stale_ants(&self, now: DateTime<Utc>) -> Vec<AntReservation> {
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .registrations
            .values()
            .filter(|r| !r.is_alive(now, self.liveness_timeout))
            .map(|r| r.ant_id.clone())
            .collect();
        let mut released = Vec::new();
        for ant_id in stale {
            let freed = state.remove_ant(&ant_id);
            warn!(ant_id = %ant_id, released = freed.len(), "removing stale registration of ant");
            released.extend(freed);
        }
        released
    }

    /// Release bindings whose allocation has not been touched by a
    /// reservation, a hand-over or a heartbeat within the reservation
    /// timeout, whatever their state.
    pub fn reap_stale_allocations(&self, now: DateTime<Utc>) -> Vec<AntReservation> {
        let mut state = self.state.write();
        let expired = |at: DateTime<Utc>| {
            now.signed_duration_since(at)
                .to_std()
                .is_ok_and(|age| age > self.reservation_timeout)
        };
        state.released.retain(|_, at| !expired(*at));
        let mut stale = Vec::new();
        for allocs in state.allocations_by_ant.values() {
            for alloc in allocs.values().filter(|a| expired(a.updated_at)) {
                for task_type in alloc.task_types.keys() {
                    stale.push(reservation_for(alloc, task_type, None));
                }
            }
        }
        for r in &stale {
            state.unbind(&r.ant_id, r.job_request_id, &r.task_type);
            info!(
                ant_id = %r.ant_id,
                request_id = %r.job_request_id,
                task_type = %r.task_type,
                "removing stale allocation of ant"
            );
        }
        for r in &stale {
            let load = state.load_of(&r.ant_id);
            if let Some(reg) = state.registrations.get_mut(&r.ant_id) {
                reg.current_load = load;
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceManager {
        ResourceManager::new(Duration::from_secs(30), Duration::from_secs(60))
    }

    fn ant(id: &str, methods: Vec<TaskMethod>, tags: &[&str], capacity: u32) -> AntRegistration {
        let mut reg = AntRegistration::new(id, methods, capacity);
        reg.tags = tags.iter().map(|t| t.to_string()).collect();
        reg
    }

    #[test]
    fn reserve_prefers_least_loaded_ant() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        rm.register(ant("b", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();

        let first = rm.reserve(req, "t1", TaskMethod::Shell, &[]).unwrap();
        assert_eq!(first.ant_id, "a");
        let second = rm.reserve(req, "t2", TaskMethod::Shell, &[]).unwrap();
        assert_eq!(second.ant_id, "b");
        assert_eq!(second.total_reservations, 2);
    }

    #[test]
    fn same_task_cannot_be_bound_twice() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        rm.register(ant("b", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();
        rm.reserve(req, "build", TaskMethod::Shell, &[]).unwrap();
        match rm.reserve(req, "build", TaskMethod::Shell, &[]) {
            Err(FormicaryError::AlreadyAllocated(_)) => {}
            other => panic!("expected AlreadyAllocated, got {other:?}"),
        }
    }

    #[test]
    fn second_task_of_same_job_shares_allocation() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();
        rm.reserve(req, "t1", TaskMethod::Shell, &[]).unwrap();
        rm.reserve(req, "t2", TaskMethod::Shell, &[]).unwrap();
        let allocs = rm.allocations_of("a");
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].load(), 2);
        assert_eq!(rm.load_of("a"), 2);
    }

    #[test]
    fn capacity_and_method_are_enforced() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &["linux"], 1)).unwrap();
        let req = Uuid::new_v4();
        assert!(matches!(
            rm.reserve(req, "t", TaskMethod::Docker, &[]),
            Err(FormicaryError::AntsUnavailable(_))
        ));
        assert!(matches!(
            rm.reserve(req, "t", TaskMethod::Shell, &["gpu".into()]),
            Err(FormicaryError::AntsUnavailable(_))
        ));
        rm.reserve(req, "t1", TaskMethod::Shell, &["linux".into()]).unwrap();
        let err = rm.reserve(req, "t2", TaskMethod::Shell, &[]).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn release_frees_binding_and_capacity() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 1)).unwrap();
        let req = Uuid::new_v4();
        let r = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&r).unwrap();
        assert!(rm.release(&r));
        assert!(!rm.release(&r));
        assert!(rm.binding_of(req, "t").is_none());
        assert!(rm.confirm(&r).is_err());
        rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
    }

    #[test]
    fn release_job_drops_everything_for_request() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();
        let other = Uuid::new_v4();
        rm.reserve(req, "t1", TaskMethod::Shell, &[]).unwrap();
        rm.reserve(req, "t2", TaskMethod::Shell, &[]).unwrap();
        rm.reserve(other, "t1", TaskMethod::Shell, &[]).unwrap();
        assert_eq!(rm.release_job(req), 2);
        assert_eq!(rm.total_bindings(), 1);
        assert_eq!(rm.load_of("a"), 1);
    }

    #[test]
    fn stale_ant_bindings_are_returned_for_rescheduling() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();
        let r = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&r).unwrap();

        assert!(rm.reap_stale_ants(Utc::now()).is_empty());
        let later = Utc::now() + chrono::Duration::seconds(31);
        let freed = rm.reap_stale_ants(later);
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].task_type, "t");
        assert!(rm.registration("a").is_none());
        assert!(rm.binding_of(req, "t").is_none());
    }

    #[test]
    fn untouched_allocations_expire_whatever_their_state() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 5)).unwrap();
        let req = Uuid::new_v4();
        let held = rm.reserve(req, "held", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&held).unwrap();
        rm.reserve(req, "dangling", TaskMethod::Shell, &[]).unwrap();

        assert!(rm.reap_stale_allocations(Utc::now()).is_empty());
        let later = Utc::now() + chrono::Duration::seconds(61);
        let mut stale: Vec<String> = rm
            .reap_stale_allocations(later)
            .into_iter()
            .map(|r| r.task_type)
            .collect();
        stale.sort();
        assert_eq!(stale, vec!["dangling", "held"]);
        assert_eq!(rm.total_bindings(), 0);
        assert_eq!(rm.load_of("a"), 0);
    }

    fn reporting(id: &str, allocation: Option<AntAllocation>) -> AntRegistration {
        let mut reg = ant(id, vec![TaskMethod::Shell], &[], 1);
        if let Some(alloc) = allocation {
            reg.allocations.insert(alloc.job_request_id, alloc);
        }
        reg
    }

    #[test]
    fn late_heartbeat_does_not_rebind_released_task() {
        let rm = manager();
        rm.register(reporting("a", None)).unwrap();
        let req = Uuid::new_v4();
        let r = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&r).unwrap();
        let mut stale_view = rm.allocations_of("a").remove(0);
        stale_view
            .task_types
            .insert("t".into(), RequestState::Executing);
        assert!(rm.release(&r));

        rm.register(reporting("a", Some(stale_view))).unwrap();
        assert_eq!(rm.binding_of(req, "t"), None);
        assert_eq!(rm.load_of("a"), 0);

        rm.register(reporting("a", None)).unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(rm.reap_stale_allocations(later).is_empty());

        let again = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        assert_eq!(again.ant_id, "a");
    }

    #[test]
    fn heartbeat_drops_bindings_the_ant_stopped_reporting() {
        let rm = manager();
        rm.register(reporting("a", None)).unwrap();
        let req = Uuid::new_v4();
        let r = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&r).unwrap();

        // Handed over after the last heartbeat: the ant may not know it yet.
        rm.register(reporting("a", None)).unwrap();
        assert_eq!(rm.binding_of(req, "t").as_deref(), Some("a"));

        rm.register(reporting("a", None)).unwrap();
        assert_eq!(rm.binding_of(req, "t"), None);
        assert_eq!(rm.load_of("a"), 0);
        assert!(rm.reserve(req, "t", TaskMethod::Shell, &[]).is_ok());
    }

    #[test]
    fn reported_allocations_stay_fresh() {
        let rm = manager();
        rm.register(reporting("a", None)).unwrap();
        let req = Uuid::new_v4();
        let r = rm.reserve(req, "t", TaskMethod::Shell, &[]).unwrap();
        rm.confirm(&r).unwrap();
        let running = rm.allocations_of("a").remove(0);

        let before = Utc::now();
        for _ in 0..3 {
            rm.register(reporting("a", Some(running.clone()))).unwrap();
        }
        assert_eq!(rm.binding_of(req, "t").as_deref(), Some("a"));
        assert!(rm.allocations_of("a")[0].updated_at >= before);
    }

    #[test]
    fn heartbeat_merges_reported_allocations() {
        let rm = manager();
        let req = Uuid::new_v4();
        let mut reg = ant("a", vec![TaskMethod::Shell], &[], 5);
        reg.allocations
            .insert(req, AntAllocation::new("a", "ant-a", req, "running"));
        rm.register(reg).unwrap();
        assert_eq!(rm.binding_of(req, "running").as_deref(), Some("a"));
        assert!(matches!(
            rm.reserve(req, "running", TaskMethod::Shell, &[]),
            Err(FormicaryError::AlreadyAllocated(_))
        ));
    }

    #[test]
    fn job_tag_check_reports_missing_method() {
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &["x"], 1)).unwrap();
        assert!(rm.has_ants_for_job_tags(&[TaskMethod::Shell], &["x".into()]).is_ok());
        assert!(rm.has_ants_for_job_tags(&[TaskMethod::Docker], &[]).is_err());
        assert!(rm.has_ants_for_job_tags(&[TaskMethod::Shell], &["y".into()]).is_err());
        assert!(rm.has_ants_for_job_tags(&[], &[]).is_err());
    }

    #[test]
    fn job_resource_check_reserves_nothing() {
        let job = JobDefinition::from_yaml(
            r#"
job_type: package
tasks:
- task_type: compile
  method: SHELL
  script: [make]
  on_completed: image
- task_type: image
  method: DOCKER
  script: [docker build .]
"#,
        )
        .unwrap();
        let rm = manager();
        rm.register(ant("a", vec![TaskMethod::Shell], &[], 1)).unwrap();
        assert!(matches!(
            rm.check_job_resources(&job),
            Err(FormicaryError::AntsUnavailable(_))
        ));

        rm.register(ant("b", vec![TaskMethod::Docker], &[], 1)).unwrap();
        let plan = rm.check_job_resources(&job).unwrap();
        let planned: Vec<(&str, &str)> = plan
            .iter()
            .map(|r| (r.task_type.as_str(), r.ant_id.as_str()))
            .collect();
        assert_eq!(planned, vec![("compile", "a"), ("image", "b")]);
        assert_eq!(rm.total_bindings(), 0);
    }
}
