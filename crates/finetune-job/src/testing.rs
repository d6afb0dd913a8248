//! In-memory store for engine tests
//!
//! Behaves like the API server for the calls the engine makes and records
//! every write in order, so tests can assert on ordering and idempotence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use finetune_common::crd::{TrainingJob, TrainingJobSpec, TrainingJobStatus};
use finetune_common::kube_utils::{controller_uid, finalizers_with, finalizers_without};
use finetune_common::{ControllerConfig, Error};

use crate::controller::Context;
use crate::store::{ObjectKey, ResourceKind, ResourceStore};

pub const NAMESPACE: &str = "ml";

/// Kind of write recorded by the fake store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Delete,
    AddFinalizer,
    RemoveFinalizer,
    Status,
}

/// One recorded write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub verb: Verb,
    pub kind: &'static str,
    pub name: String,
}

impl Op {
    pub fn new(verb: Verb, kind: &'static str, name: &str) -> Self {
        Self {
            verb,
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<ObjectKey, TrainingJob>,
    secrets: BTreeMap<ObjectKey, Secret>,
    claims: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    compute_jobs: BTreeMap<ObjectKey, Job>,
    held: HashSet<(ResourceKind, ObjectKey)>,
    failures: HashMap<&'static str, u16>,
    ops: Vec<Op>,
    gate_violations: usize,
}

impl State {
    fn record(&mut self, verb: Verb, kind: &'static str, name: &str) {
        self.ops.push(Op::new(verb, kind, name));
    }

    fn meta_mut(&mut self, kind: ResourceKind, key: &ObjectKey) -> Option<&mut ObjectMeta> {
        match kind {
            ResourceKind::Credential => self.secrets.get_mut(key).map(|o| &mut o.metadata),
            ResourceKind::VolumeClaim => self.claims.get_mut(key).map(|o| &mut o.metadata),
            ResourceKind::ComputeJob => self.compute_jobs.get_mut(key).map(|o| &mut o.metadata),
        }
    }

    fn remove(&mut self, kind: ResourceKind, key: &ObjectKey) -> bool {
        match kind {
            ResourceKind::Credential => self.secrets.remove(key).is_some(),
            ResourceKind::VolumeClaim => self.claims.remove(key).is_some(),
            ResourceKind::ComputeJob => self.compute_jobs.remove(key).is_some(),
        }
    }

    /// Dependents of the job at `key` still present in the store
    fn dependents_of(&self, key: &ObjectKey, uid: &str) -> usize {
        let owned_secrets = self
            .secrets
            .values()
            .filter(|s| controller_uid(&s.metadata) == Some(uid))
            .count();
        owned_secrets
            + usize::from(self.claims.contains_key(key))
            + usize::from(self.compute_jobs.contains_key(key))
    }
}

/// [`ResourceStore`] over in-memory maps
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_job(&self, job: TrainingJob) -> ObjectKey {
        let key = ObjectKey::for_job(&job).unwrap();
        self.state().jobs.insert(key.clone(), job);
        key
    }

    pub fn job(&self, key: &ObjectKey) -> Option<TrainingJob> {
        self.state().jobs.get(key).cloned()
    }

    pub fn update_spec(&self, key: &ObjectKey, edit: impl FnOnce(&mut TrainingJobSpec)) {
        let mut state = self.state();
        edit(&mut state.jobs.get_mut(key).unwrap().spec);
    }

    /// Simulate `kubectl delete` on a TrainingJob
    pub fn mark_deleted(&self, key: &ObjectKey) {
        let mut state = self.state();
        let job = state.jobs.get_mut(key).unwrap();
        job.metadata.deletion_timestamp = Some(Time(Utc::now()));
        if job.metadata.finalizers.as_ref().map_or(true, Vec::is_empty) {
            state.jobs.remove(key);
        }
    }

    /// Deletes of this object leave it terminating until released
    pub fn hold_deletion(&self, kind: ResourceKind, key: &ObjectKey) {
        self.state().held.insert((kind, key.clone()));
    }

    /// Let a held object finish terminating
    pub fn release_deletion(&self, kind: ResourceKind, key: &ObjectKey) {
        let mut state = self.state();
        state.held.remove(&(kind, key.clone()));
        let terminating = state
            .meta_mut(kind, key)
            .is_some_and(|m| m.deletion_timestamp.is_some());
        if terminating {
            state.remove(kind, key);
        }
    }

    /// Pretend the object has been terminating for `secs` seconds
    pub fn backdate_deletion(&self, kind: ResourceKind, key: &ObjectKey, secs: i64) {
        let mut state = self.state();
        if let Some(meta) = state.meta_mut(kind, key) {
            meta.deletion_timestamp = Some(Time(Utc::now() - chrono::Duration::seconds(secs)));
        }
    }

    /// Make the next call of the named store method fail with `code`
    pub fn fail_once(&self, call: &'static str, code: u16) {
        self.state().failures.insert(call, code);
    }

    fn injected(&self, call: &'static str) -> Result<(), Error> {
        match self.state().failures.remove(call) {
            Some(code) => Err(api_error(code)),
            None => Ok(()),
        }
    }

    /// Strip every owner reference from a dependent
    pub fn disown(&self, kind: ResourceKind, key: &ObjectKey) {
        if let Some(meta) = self.state().meta_mut(kind, key) {
            meta.owner_references = None;
        }
    }

    /// Remove a Job behind the engine's back
    pub fn remove_compute_job(&self, key: &ObjectKey) {
        self.state().compute_jobs.remove(key);
    }

    pub fn secret(&self, key: &ObjectKey) -> Option<Secret> {
        self.state().secrets.get(key).cloned()
    }

    pub fn claim(&self, key: &ObjectKey) -> Option<PersistentVolumeClaim> {
        self.state().claims.get(key).cloned()
    }

    pub fn compute_job(&self, key: &ObjectKey) -> Option<Job> {
        self.state().compute_jobs.get(key).cloned()
    }

    /// All recorded writes except status updates
    pub fn writes(&self) -> Vec<Op> {
        self.state()
            .ops
            .iter()
            .filter(|op| op.verb != Verb::Status)
            .cloned()
            .collect()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Times a finalizer was released while dependents still existed
    pub fn gate_violations(&self) -> usize {
        self.state().gate_violations
    }

    pub fn status(&self, key: &ObjectKey) -> Option<TrainingJobStatus> {
        self.state().jobs.get(key).and_then(|j| j.status.clone())
    }
}

pub fn api_error(code: u16) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("HTTP {}", code),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}

fn create_into<T: Clone>(
    map: &mut BTreeMap<ObjectKey, T>,
    namespace: &str,
    meta: &ObjectMeta,
    obj: &T,
) -> Result<String, Error> {
    let name = meta.name.clone().unwrap_or_default();
    let key = ObjectKey::new(namespace, name.clone());
    if map.contains_key(&key) {
        return Err(api_error(409));
    }
    map.insert(key, obj.clone());
    Ok(name)
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get_training_job(&self, key: &ObjectKey) -> Result<Option<TrainingJob>, Error> {
        Ok(self.job(key))
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        let Some(finalizers) = finalizers_with(&job.metadata, finalizer) else {
            return Ok(false);
        };
        job.metadata.finalizers = Some(finalizers);
        state.record(Verb::AddFinalizer, "TrainingJob", &key.name);
        Ok(true)
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<bool, Error> {
        let mut state = self.state();
        let Some(job) = state.jobs.get(key) else {
            return Ok(false);
        };
        let Some(finalizers) = finalizers_without(&job.metadata, finalizer) else {
            return Ok(false);
        };
        let uid = job.metadata.uid.clone().unwrap_or_default();
        let gone = finalizers.is_empty() && job.metadata.deletion_timestamp.is_some();

        if state.dependents_of(key, &uid) > 0 {
            state.gate_violations += 1;
        }
        if gone {
            state.jobs.remove(key);
        } else if let Some(job) = state.jobs.get_mut(key) {
            job.metadata.finalizers = Some(finalizers);
        }
        state.record(Verb::RemoveFinalizer, "TrainingJob", &key.name);
        Ok(true)
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &TrainingJobStatus,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let Some(job) = state.jobs.get_mut(key) else {
            return Err(api_error(404));
        };
        job.status = Some(status.clone());
        state.record(Verb::Status, "TrainingJob", &key.name);
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, Error> {
        self.injected("get_secret")?;
        Ok(self.secret(key))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let mut state = self.state();
        let name = create_into(&mut state.secrets, namespace, &secret.metadata, secret)?;
        state.record(Verb::Create, "Secret", &name);
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let mut state = self.state();
        let name = secret.metadata.name.clone().unwrap_or_default();
        let key = ObjectKey::new(namespace, name.clone());
        if !state.secrets.contains_key(&key) {
            return Err(api_error(404));
        }
        state.secrets.insert(key, secret.clone());
        state.record(Verb::Update, "Secret", &name);
        Ok(())
    }

    async fn get_volume_claim(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.injected("get_volume_claim")?;
        Ok(self.claim(key))
    }

    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let name = create_into(&mut state.claims, namespace, &claim.metadata, claim)?;
        state.record(Verb::Create, "PersistentVolumeClaim", &name);
        Ok(())
    }

    async fn get_compute_job(&self, key: &ObjectKey) -> Result<Option<Job>, Error> {
        self.injected("get_compute_job")?;
        Ok(self.compute_job(key))
    }

    async fn create_compute_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let mut state = self.state();
        let name = create_into(&mut state.compute_jobs, namespace, &job.metadata, job)?;
        state.record(Verb::Create, "Job", &name);
        Ok(())
    }

    async fn get_metadata(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> Result<Option<ObjectMeta>, Error> {
        Ok(self.state().meta_mut(kind, key).map(|m| m.clone()))
    }

    async fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Result<bool, Error> {
        let mut state = self.state();
        let held = state.held.contains(&(kind, key.clone()));
        let existed = if held {
            match state.meta_mut(kind, key) {
                Some(meta) => {
                    meta.deletion_timestamp
                        .get_or_insert_with(|| Time(Utc::now()));
                    true
                }
                None => false,
            }
        } else {
            state.remove(kind, key)
        };
        if existed {
            state.record(Verb::Delete, kind.kind_str(), &key.name);
        }
        Ok(existed)
    }

    async fn set_owner_references(
        &self,
        kind: ResourceKind,
        key: &ObjectKey,
        _resource_version: Option<String>,
        owner_references: Vec<OwnerReference>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        let Some(meta) = state.meta_mut(kind, key) else {
            return Err(api_error(404));
        };
        meta.owner_references = Some(owner_references);
        state.record(Verb::Update, kind.kind_str(), &key.name);
        Ok(())
    }
}

/// A TrainingJob in the test namespace with only the token set
pub fn training_job(name: &str, token: &str) -> TrainingJob {
    let mut job = TrainingJob::new(
        name,
        TrainingJobSpec {
            hugging_face_secret: token.to_string(),
            ..Default::default()
        },
    );
    job.metadata.namespace = Some(NAMESPACE.to_string());
    job.metadata.uid = Some(format!("uid-{}", name));
    job
}

/// Engine context over `store` with test timings
pub fn context(store: Arc<FakeStore>) -> Arc<Context> {
    Arc::new(Context::with_store(store, ControllerConfig::for_testing()))
}
