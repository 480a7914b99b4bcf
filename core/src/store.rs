// SPDX-License-Identifier: MIT OR Apache-2.0

//! Explicit weight store keyed by symbolic parameter paths
//!
//! Every trainable tensor of a network lives here under a stable [`ParamPath`].
//! Construction calls ask the store for a path: the first call allocates the
//! parameter, later calls get the very same tensor back, so gradients computed
//! through any of the returned handles land on one parameter.

use std::collections::HashMap;
use std::fmt;
use std::ops::Div;

use burn::module::{Param, ParamId, Parameter};
use burn::nn::Initializer;
use burn::tensor::{backend::Backend, Tensor};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{check_shape, NetError, Result};

/// Slash separated name of a parameter, e.g. `board_kernel/hidden_0/kernel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamPath(String);

impl ParamPath {
    /// The empty path, parent of every top-level scope
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Child path `self/name`
    pub fn join(&self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if self.0.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Div<&str> for &ParamPath {
    type Output = ParamPath;

    fn div(self, rhs: &str) -> ParamPath {
        self.join(rhs)
    }
}

impl Div<String> for &ParamPath {
    type Output = ParamPath;

    fn div(self, rhs: String) -> ParamPath {
        self.join(rhs)
    }
}

impl Div<&str> for ParamPath {
    type Output = ParamPath;

    fn div(self, rhs: &str) -> ParamPath {
        self.join(rhs)
    }
}

/// Fan-in / fan-out hints handed to variance scaling initializers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fans {
    pub fan_in: Option<usize>,
    pub fan_out: Option<usize>,
}

impl Fans {
    pub fn new(fan_in: usize, fan_out: usize) -> Self {
        Self {
            fan_in: Some(fan_in),
            fan_out: Some(fan_out),
        }
    }
}

/// A stored parameter of one of the ranks used by the kernels
pub enum StoredParam<B: Backend> {
    Vector(Param<Tensor<B, 1>>),
    Matrix(Param<Tensor<B, 2>>),
    Kernel(Param<Tensor<B, 4>>),
}

impl<B: Backend> StoredParam<B> {
    fn rank(&self) -> usize {
        match self {
            StoredParam::Vector(_) => 1,
            StoredParam::Matrix(_) => 2,
            StoredParam::Kernel(_) => 4,
        }
    }

    fn id(&self) -> ParamId {
        match self {
            StoredParam::Vector(p) => p.id,
            StoredParam::Matrix(p) => p.id,
            StoredParam::Kernel(p) => p.id,
        }
    }

    fn squared_sum(&self) -> Tensor<B, 1> {
        match self {
            StoredParam::Vector(p) => p.val().powf_scalar(2.0).sum(),
            StoredParam::Matrix(p) => p.val().powf_scalar(2.0).sum(),
            StoredParam::Kernel(p) => p.val().powf_scalar(2.0).sum(),
        }
    }
}

/// Tensor ranks that can be kept in a [`WeightStore`]
pub trait StoredRank<B: Backend>: Sized + Parameter {
    fn wrap(param: Param<Self>) -> StoredParam<B>;

    fn value(param: &StoredParam<B>) -> Option<Self>;
}

macro_rules! stored_rank {
    ($rank:literal, $variant:ident) => {
        impl<B: Backend> StoredRank<B> for Tensor<B, $rank> {
            fn wrap(param: Param<Self>) -> StoredParam<B> {
                StoredParam::$variant(param)
            }

            fn value(param: &StoredParam<B>) -> Option<Self> {
                match param {
                    StoredParam::$variant(p) => Some(p.val()),
                    _ => None,
                }
            }
        }
    };
}

stored_rank!(1, Vector);
stored_rank!(2, Matrix);
stored_rank!(4, Kernel);

struct Entry<B: Backend> {
    param: StoredParam<B>,
    shape: Vec<usize>,
    regularized: bool,
}

/// Mapping from parameter path to owned parameter tensors
///
/// Allocation is idempotent per path. Construction is expected to happen in a single
/// pass on one thread; a call that finds the store already locked fails with
/// [`NetError::StoreContended`] instead of waiting.
pub struct WeightStore<B: Backend> {
    device: B::Device,
    entries: Mutex<HashMap<ParamPath, Entry<B>>>,
    running: Mutex<HashMap<ParamPath, Tensor<B, 1>>>,
}

impl<B: Backend> WeightStore<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            entries: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    fn lock_entries(&self, path: &ParamPath) -> Result<MutexGuard<'_, HashMap<ParamPath, Entry<B>>>> {
        self.entries
            .try_lock()
            .ok_or_else(|| NetError::StoreContended(path.to_string()))
    }

    fn lock_running(&self, path: &ParamPath) -> Result<MutexGuard<'_, HashMap<ParamPath, Tensor<B, 1>>>> {
        self.running
            .try_lock()
            .ok_or_else(|| NetError::StoreContended(path.to_string()))
    }

    fn stored_value<const D: usize>(path: &ParamPath, entry: &Entry<B>, shape: &[usize]) -> Result<Tensor<B, D>>
    where
        Tensor<B, D>: StoredRank<B>,
    {
        let value = <Tensor<B, D> as StoredRank<B>>::value(&entry.param).ok_or_else(|| {
            NetError::RankMismatch {
                path: path.to_string(),
                stored: entry.param.rank(),
                requested: D,
            }
        })?;
        check_shape(path.as_str(), &entry.shape, shape)?;
        trace!(path = %path, "reusing parameter");
        Ok(value)
    }

    /// Returns the parameter at `path`, allocating it with `initializer` on first use
    pub fn get_or_init<const D: usize>(
        &self,
        path: &ParamPath,
        shape: [usize; D],
        initializer: &Initializer,
        fans: Fans,
        regularized: bool,
    ) -> Result<Tensor<B, D>>
    where
        Tensor<B, D>: StoredRank<B>,
    {
        let mut entries = self.lock_entries(path)?;
        if let Some(entry) = entries.get(path) {
            return Self::stored_value(path, entry, &shape);
        }

        let param: Param<Tensor<B, D>> =
            initializer.init_with(shape, fans.fan_in, fans.fan_out, &self.device);
        let value = param.val();
        entries.insert(
            path.clone(),
            Entry {
                param: <Tensor<B, D> as StoredRank<B>>::wrap(param),
                shape: shape.to_vec(),
                regularized,
            },
        );
        debug!(path = %path, ?shape, "allocated parameter");
        Ok(value)
    }

    /// Returns the parameter at `path`, registering `value` as its initial value on
    /// first use. Later calls ignore `value` and return the stored parameter.
    pub fn get_or_insert<const D: usize>(&self, path: &ParamPath, value: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        Tensor<B, D>: StoredRank<B>,
    {
        let shape = value.dims();
        let mut entries = self.lock_entries(path)?;
        if let Some(entry) = entries.get(path) {
            return Self::stored_value(path, entry, &shape);
        }

        let param = Param::from_tensor(value);
        let stored = param.val();
        entries.insert(
            path.clone(),
            Entry {
                param: <Tensor<B, D> as StoredRank<B>>::wrap(param),
                shape: shape.to_vec(),
                regularized: false,
            },
        );
        debug!(path = %path, ?shape, "registered explicit parameter");
        Ok(stored)
    }

    /// Looks up an existing parameter
    pub fn get<const D: usize>(&self, path: &ParamPath) -> Result<Option<Tensor<B, D>>>
    where
        Tensor<B, D>: StoredRank<B>,
    {
        let entries = self.lock_entries(path)?;
        match entries.get(path) {
            Some(entry) => {
                let shape = entry.shape.clone();
                Self::stored_value(path, entry, &shape).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Replaces the value of an existing parameter, keeping its id.
    ///
    /// This is the hook for the external optimizer; forward computations never call it.
    pub fn assign<const D: usize>(&self, path: &ParamPath, value: Tensor<B, D>) -> Result<()>
    where
        Tensor<B, D>: StoredRank<B>,
    {
        let mut entries = self.lock_entries(path)?;
        let entry = entries.get_mut(path).ok_or_else(|| {
            NetError::InvalidConfig(format!("no parameter registered at {path}"))
        })?;
        if entry.param.rank() != D {
            return Err(NetError::RankMismatch {
                path: path.to_string(),
                stored: entry.param.rank(),
                requested: D,
            });
        }
        check_shape(path.as_str(), &entry.shape, &value.dims())?;

        let id = entry.param.id();
        entry.param = <Tensor<B, D> as StoredRank<B>>::wrap(Param::initialized(
            id,
            value.detach().require_grad(),
        ));
        trace!(path = %path, "parameter value replaced");
        Ok(())
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.entries.lock().contains_key(path)
    }

    /// Number of registered parameter tensors
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sorted list of registered parameter paths
    pub fn paths(&self) -> Vec<ParamPath> {
        let mut paths: Vec<_> = self.entries.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Total number of scalar weights
    pub fn num_params(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.shape.iter().product::<usize>())
            .sum()
    }

    /// Sum of squared weights over every parameter registered as regularized
    pub fn regularization_loss(&self) -> Result<Tensor<B, 1>> {
        let entries = self.lock_entries(&ParamPath::root())?;
        let mut total = Tensor::<B, 1>::zeros([1], &self.device);
        for entry in entries.values().filter(|entry| entry.regularized) {
            total = total + entry.param.squared_sum();
        }
        Ok(total)
    }

    /// Non-trainable running statistic at `path`, created with `init` on first use
    pub fn running_stat<F>(&self, path: &ParamPath, init: F) -> Result<Tensor<B, 1>>
    where
        F: FnOnce(&B::Device) -> Tensor<B, 1>,
    {
        let mut running = self.lock_running(path)?;
        let value = running
            .entry(path.clone())
            .or_insert_with(|| {
                debug!(path = %path, "allocated running statistic");
                init(&self.device).detach()
            })
            .clone();
        Ok(value)
    }

    pub fn set_running_stat(&self, path: &ParamPath, value: Tensor<B, 1>) -> Result<()> {
        let mut running = self.lock_running(path)?;
        running.insert(path.clone(), value.detach());
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for WeightStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightStore")
            .field("device", &self.device)
            .field("params", &self.len())
            .finish()
    }
}
