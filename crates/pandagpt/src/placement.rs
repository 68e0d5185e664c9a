use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("no accelerator is visible")]
    NoDevices,

    #[error("device {device} is out of range, {device_count} visible")]
    DeviceOutOfRange {
        device: DeviceId,
        device_count: usize,
    },

    #[error("module `{module}` ({size} bytes) does not fit in the remaining device memory")]
    DoesNotFit { module: String, size: u64 },

    #[error("module `{0}` is not assigned to any device")]
    Unassigned(String),

    #[error("placement names unknown module `{0}`")]
    UnknownModule(String),

    #[error(transparent)]
    Solver(anyhow::Error),

    #[error(transparent)]
    Dispatch(anyhow::Error),
}

/// The two devices one process spreads the model over.
///
/// Processes on a node pair up so that rank `r` uses device `r` and the
/// device half the node away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePair {
    pub primary: DeviceId,
    pub secondary: DeviceId,
}

impl DevicePair {
    pub fn derive(rank: usize, device_count: usize) -> Self {
        Self {
            primary: DeviceId(rank),
            secondary: DeviceId(rank + device_count / 2),
        }
    }

    /// Like [`DevicePair::derive`], but both devices must be visible.
    pub fn checked(rank: usize, device_count: usize) -> Result<Self, PlacementError> {
        if device_count == 0 {
            return Err(PlacementError::NoDevices);
        }

        let pair = Self::derive(rank, device_count);
        for device in [pair.primary, pair.secondary] {
            if device.0 >= device_count {
                return Err(PlacementError::DeviceOutOfRange {
                    device,
                    device_count,
                });
            }
        }

        Ok(pair)
    }
}

/// A node of the wrapped model's module tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNode {
    pub name: String,
    pub class_name: String,
    /// Bytes of parameters owned directly by this module, children excluded.
    pub size_bytes: u64,
    pub children: Vec<ModuleNode>,
}

impl ModuleNode {
    pub fn leaf(name: impl Into<String>, class_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            size_bytes,
            children: vec![],
        }
    }

    pub fn container(
        name: impl Into<String>,
        class_name: impl Into<String>,
        children: Vec<ModuleNode>,
    ) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            size_bytes: 0,
            children,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.size_bytes + self.children.iter().map(|c| c.total_size()).sum::<u64>()
    }

    fn visit<'a>(&'a self, prefix: &str, f: &mut impl FnMut(String, &'a ModuleNode)) {
        let path = join_path(prefix, &self.name);
        for child in &self.children {
            child.visit(&path, f);
        }
        f(path, self);
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn covers(entry: &str, path: &str) -> bool {
    entry.is_empty()
        || path == entry
        || (path.starts_with(entry) && path.as_bytes().get(entry.len()) == Some(&b'.'))
}

/// Ordered per-device memory ceilings, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    devices: Vec<(DeviceId, u64)>,
}

impl MemoryBudget {
    /// Same ceiling on every device; repeated devices are listed once.
    pub fn uniform(devices: impl IntoIterator<Item = DeviceId>, bytes: u64) -> Self {
        let mut seen = BTreeSet::new();
        let devices = devices
            .into_iter()
            .filter(|d| seen.insert(*d))
            .map(|d| (d, bytes))
            .collect();

        Self { devices }
    }

    pub fn for_pair(pair: DevicePair, bytes: u64) -> Self {
        Self::uniform([pair.primary, pair.secondary], bytes)
    }

    pub fn devices(&self) -> &[(DeviceId, u64)] {
        &self.devices
    }
}

/// Module path to device assignment. A module without its own entry lives
/// on the device of its closest assigned ancestor; the empty path covers
/// the whole model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DevicePlacement {
    entries: BTreeMap<String, DeviceId>,
}

impl DevicePlacement {
    pub fn insert(&mut self, module: impl Into<String>, device: DeviceId) -> Option<DeviceId> {
        self.entries.insert(module.into(), device)
    }

    /// Force `module` and everything below it onto `device`.
    pub fn pin(&mut self, module: &str, device: DeviceId) {
        self.entries
            .retain(|k, _| k.as_str() == module || !covers(module, k));
        self.entries.insert(module.to_string(), device);
    }

    pub fn get(&self, module: &str) -> Option<DeviceId> {
        self.entries.get(module).copied()
    }

    /// Device of `path`, resolved through the most specific covering entry.
    pub fn device_for(&self, path: &str) -> Option<DeviceId> {
        self.entries
            .iter()
            .filter(|(entry, _)| covers(entry, path))
            .max_by_key(|(entry, _)| entry.len())
            .map(|(_, device)| *device)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DeviceId)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.entries.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry must name a module of the tree and every leaf module
    /// must resolve to a device.
    pub fn validate(&self, modules: &[ModuleNode]) -> Result<(), PlacementError> {
        let mut paths = BTreeSet::new();
        let mut leaves = vec![];
        for module in modules {
            module.visit("", &mut |path, node| {
                if node.children.is_empty() {
                    leaves.push(path.clone());
                }
                paths.insert(path);
            });
        }

        if let Some(unknown) = self
            .entries
            .keys()
            .find(|k| !k.is_empty() && !paths.contains(k.as_str()))
        {
            return Err(PlacementError::UnknownModule(unknown.clone()));
        }

        match leaves
            .into_iter()
            .find(|leaf| self.device_for(leaf).is_none())
        {
            Some(leaf) => Err(PlacementError::Unassigned(leaf)),
            None => Ok(()),
        }
    }
}

pub trait PlacementSolver {
    fn solve(
        &self,
        modules: &[ModuleNode],
        budget: &MemoryBudget,
        no_split: &[&str],
    ) -> Result<DevicePlacement, PlacementError>;
}

/// Fills devices in budget order, walking modules in declaration order.
///
/// A module that does not fit the current device is split into its
/// children, unless it has none or its class is listed as unsplittable,
/// in which case the solver moves on to the next device.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyPlacementSolver;

impl PlacementSolver for GreedyPlacementSolver {
    fn solve(
        &self,
        modules: &[ModuleNode],
        budget: &MemoryBudget,
        no_split: &[&str],
    ) -> Result<DevicePlacement, PlacementError> {
        let mut devices = budget.devices().iter().copied();
        let (mut current, mut remaining) = devices.next().ok_or(PlacementError::NoDevices)?;

        let mut placement = DevicePlacement::default();
        let mut queue: VecDeque<(String, &ModuleNode)> =
            modules.iter().map(|m| (m.name.clone(), m)).collect();

        while let Some((path, node)) = queue.pop_front() {
            let size = node.total_size();
            if size <= remaining {
                placement.insert(path, current);
                remaining -= size;
                continue;
            }

            let splittable =
                !node.children.is_empty() && !no_split.contains(&node.class_name.as_str());
            if splittable && node.size_bytes <= remaining {
                tracing::debug!(
                    "splitting module `{}` ({} bytes) across devices",
                    path,
                    size
                );
                if node.size_bytes > 0 {
                    placement.insert(path.clone(), current);
                    remaining -= node.size_bytes;
                }
                for child in node.children.iter().rev() {
                    queue.push_front((join_path(&path, &child.name), child));
                }
                continue;
            }

            match devices.next() {
                Some((device, capacity)) => {
                    tracing::debug!("device {} full, moving on to {}", current, device);
                    current = device;
                    remaining = capacity;
                    queue.push_front((path, node));
                }
                None => return Err(PlacementError::DoesNotFit { module: path, size }),
            }
        }

        Ok(placement)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decoder(n: usize, size: u64) -> Vec<ModuleNode> {
        (0..n)
            .map(|i| {
                ModuleNode::container(
                    i.to_string(),
                    "LlamaDecoderLayer",
                    vec![
                        ModuleNode::leaf("self_attn", "LlamaAttention", size / 2),
                        ModuleNode::leaf("mlp", "LlamaMLP", size - size / 2),
                    ],
                )
            })
            .collect()
    }

    fn model() -> Vec<ModuleNode> {
        vec![
            ModuleNode::container(
                "visual",
                "VisionTransformer",
                vec![
                    ModuleNode::leaf("embed", "Embedding", 10),
                    ModuleNode::leaf("blocks", "ModuleList", 30),
                ],
            ),
            ModuleNode::container(
                "llama",
                "LlamaModel",
                vec![
                    ModuleNode::leaf("embed_tokens", "Embedding", 20),
                    ModuleNode::container("layers", "ModuleList", decoder(4, 20)),
                    ModuleNode::leaf("lm_head", "Linear", 20),
                ],
            ),
            ModuleNode::leaf("proj", "Linear", 5),
        ]
    }

    #[test]
    fn test_device_pair() {
        assert_eq!(
            DevicePair::derive(0, 2),
            DevicePair {
                primary: DeviceId(0),
                secondary: DeviceId(1)
            }
        );
        assert_eq!(
            DevicePair::derive(0, 1),
            DevicePair {
                primary: DeviceId(0),
                secondary: DeviceId(0)
            }
        );

        for device_count in (2..=16).step_by(2) {
            for rank in 0..device_count / 2 {
                let pair = DevicePair::checked(rank, device_count).unwrap();
                assert_eq!(pair.primary, DeviceId(rank));
                assert_eq!(pair.secondary.0 - pair.primary.0, device_count / 2);
            }
        }

        assert!(matches!(
            DevicePair::checked(0, 0),
            Err(PlacementError::NoDevices)
        ));
        assert!(matches!(
            DevicePair::checked(1, 2),
            Err(PlacementError::DeviceOutOfRange {
                device: DeviceId(2),
                device_count: 2
            })
        ));
    }

    #[test]
    fn test_budget_dedup() {
        let budget = MemoryBudget::for_pair(DevicePair::derive(0, 1), 100);
        assert_eq!(budget.devices(), &[(DeviceId(0), 100)]);
    }

    #[test]
    fn test_fits_on_one_device() {
        let budget = MemoryBudget::uniform([DeviceId(0), DeviceId(1)], 1000);
        let placement = GreedyPlacementSolver
            .solve(&model(), &budget, &["LlamaDecoderLayer"])
            .unwrap();

        assert_eq!(placement.devices(), BTreeSet::from([DeviceId(0)]));
        assert_eq!(placement.get("visual"), Some(DeviceId(0)));
        assert_eq!(
            placement.device_for("llama.layers.3.mlp"),
            Some(DeviceId(0))
        );
        placement.validate(&model()).unwrap();
    }

    #[test]
    fn test_split_across_devices() {
        // 40 vision + 20 embed + 4 * 20 layers + 20 head + 5 proj = 165 bytes
        let budget = MemoryBudget::uniform([DeviceId(0), DeviceId(2)], 100);
        let no_split = ["LlamaDecoderLayer", "VisionTransformer"];
        let placement = GreedyPlacementSolver
            .solve(&model(), &budget, &no_split)
            .unwrap();

        assert_eq!(placement.get("visual"), Some(DeviceId(0)));
        assert_eq!(placement.get("llama.embed_tokens"), Some(DeviceId(0)));
        assert_eq!(placement.get("llama.layers.1"), Some(DeviceId(0)));
        assert_eq!(placement.get("llama.layers.2"), Some(DeviceId(2)));
        assert_eq!(placement.get("llama.lm_head"), Some(DeviceId(2)));
        assert_eq!(placement.get("proj"), Some(DeviceId(2)));

        // decoder layers stay whole
        for (entry, _) in placement.iter() {
            assert!(!entry.ends_with("self_attn") && !entry.ends_with("mlp"));
        }
        placement.validate(&model()).unwrap();
    }

    #[test]
    fn test_does_not_fit() {
        let budget = MemoryBudget::uniform([DeviceId(0)], 30);
        let res = GreedyPlacementSolver.solve(&model(), &budget, &["VisionTransformer"]);
        assert!(matches!(
            res,
            Err(PlacementError::DoesNotFit { module, size: 40 }) if module == "visual"
        ));

        let res =
            GreedyPlacementSolver.solve(&model(), &MemoryBudget::uniform(Vec::new(), 30), &[]);
        assert!(matches!(res, Err(PlacementError::NoDevices)));
    }

    #[test]
    fn test_pin_overrides_solver() {
        let mut placement = DevicePlacement::default();
        placement.insert("visual", DeviceId(0));
        placement.insert("llama", DeviceId(1));
        placement.insert("llama.layers.2.mlp", DeviceId(1));
        placement.insert("proj", DeviceId(1));

        placement.pin("llama.layers.2", DeviceId(0));
        placement.pin("proj", DeviceId(0));

        assert_eq!(placement.get("llama.layers.2.mlp"), None);
        assert_eq!(
            placement.device_for("llama.layers.2.mlp"),
            Some(DeviceId(0))
        );
        assert_eq!(placement.device_for("llama.layers.3"), Some(DeviceId(1)));
        assert_eq!(placement.device_for("proj"), Some(DeviceId(0)));
        placement.validate(&model()).unwrap();
    }

    #[test]
    fn test_validate() {
        let mut placement = DevicePlacement::default();
        placement.insert("visual", DeviceId(0));
        placement.insert("llama", DeviceId(0));
        assert!(matches!(
            placement.validate(&model()),
            Err(PlacementError::Unassigned(leaf)) if leaf == "proj"
        ));

        placement.insert("projector", DeviceId(0));
        assert!(matches!(
            placement.validate(&model()),
            Err(PlacementError::UnknownModule(m)) if m == "projector"
        ));

        let mut placement = DevicePlacement::default();
        placement.insert("", DeviceId(3));
        assert_eq!(placement.device_for("llama.lm_head"), Some(DeviceId(3)));
        placement.validate(&model()).unwrap();
    }
}
