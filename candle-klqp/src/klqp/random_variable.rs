use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Error, Result, Shape, Tensor, TensorId, Var};
use candle_nn::VarBuilder;

use super::detached::Detached;
use super::distribution::{Distribution, Family};

static NEXT_RV_ID: AtomicUsize = AtomicUsize::new(0);

/// Identity of a random variable node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RvId(usize);

/// Maps parent values to the distribution of a node.
///
/// Parent values arrive in the order of [`RandomVariable::parents`],
/// each with a leading Monte Carlo sample axis (of size S, or 1 for
/// observations that broadcast over samples).
pub type Conditional = dyn Fn(&[Tensor]) -> Result<Distribution> + Send + Sync;

struct RvNode {
    id: RvId,
    name: Box<str>,
    family: Family,
    parents: Vec<RandomVariable>,
    params: Vec<TensorId>,
    conditional: Box<Conditional>,
}

/// A node of a probabilistic model graph.
///
/// Nodes are immutable once built and cheap to clone; equality and
/// hashing go by node identity. The same type represents model
/// variables p(z | pa(z)) and approximating factors q(z; λ).
#[derive(Clone)]
pub struct RandomVariable(Arc<RvNode>);

impl RandomVariable {
    /// Create a node from its parents and a conditional distribution.
    ///
    /// # Arguments
    /// * `name` - label used in logs and error messages
    /// * `family` - family the conditional must return
    /// * `parents` - nodes whose values feed `conditional`
    /// * `params` - trainable parameters the conditional reads
    /// * `conditional` - parent values -> distribution
    pub fn new<F>(
        name: &str,
        family: Family,
        parents: Vec<RandomVariable>,
        params: Vec<Var>,
        conditional: F,
    ) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Distribution> + Send + Sync + 'static,
    {
        let id = RvId(NEXT_RV_ID.fetch_add(1, Ordering::Relaxed));
        Self(Arc::new(RvNode {
            id,
            name: name.into(),
            family,
            parents,
            params: params.iter().map(|v| v.as_tensor().id()).collect(),
            conditional: Box::new(conditional),
        }))
    }

    /// Root normal node N(loc, scale²) with fixed parameters
    pub fn normal(name: &str, loc: Tensor, scale: Tensor) -> Self {
        Self::new(name, Family::Normal, vec![], vec![], move |_| {
            Ok(Distribution::Normal {
                loc: loc.clone(),
                scale: scale.clone(),
            })
        })
    }

    /// Root Bernoulli node with fixed logits
    pub fn bernoulli(name: &str, logits: Tensor) -> Self {
        Self::new(name, Family::Bernoulli, vec![], vec![], move |_| {
            Ok(Distribution::Bernoulli {
                logits: logits.clone(),
            })
        })
    }

    /// Normal approximation q = N(mean, exp(ln_std)²) over trainable
    /// parameters.
    pub fn normal_from_vars(name: &str, mean: Var, ln_std: Var) -> Self {
        let params = vec![mean.clone(), ln_std.clone()];
        Self::new(name, Family::Normal, vec![], params, move |_| {
            Ok(Distribution::Normal {
                loc: mean.as_tensor().clone(),
                scale: ln_std.as_tensor().exp()?,
            })
        })
    }

    /// Bernoulli approximation over trainable logits
    pub fn bernoulli_from_var(name: &str, logits: Var) -> Self {
        let params = vec![logits.clone()];
        Self::new(name, Family::Bernoulli, vec![], params, move |_| {
            Ok(Distribution::Bernoulli {
                logits: logits.as_tensor().clone(),
            })
        })
    }

    /// Normal approximation with parameters registered in a `VarBuilder`
    ///
    /// Starts at mean = 0 and std = 1.
    ///
    /// # Arguments
    /// * `vb` - VarBuilder backed by a `VarMap`
    /// * `name` - node name
    /// * `shape` - shape of one draw
    pub fn normal_variational<S: Into<Shape>>(
        vb: VarBuilder,
        name: &str,
        shape: S,
    ) -> Result<Self> {
        let shape: Shape = shape.into();
        let mean = vb.get_with_hints(shape.clone(), "mean", candle_nn::Init::Const(0.0))?;
        let ln_std = vb.get_with_hints(shape, "ln_std", candle_nn::Init::Const(0.0))?;
        Ok(Self::normal_from_vars(
            name,
            Var::from_tensor(&mean)?,
            Var::from_tensor(&ln_std)?,
        ))
    }

    pub fn id(&self) -> RvId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn family(&self) -> Family {
        self.0.family
    }

    pub fn is_continuous(&self) -> bool {
        self.0.family.is_continuous()
    }

    pub fn is_reparameterized(&self) -> bool {
        self.0.family.is_reparameterized()
    }

    pub fn parents(&self) -> &[RandomVariable] {
        &self.0.parents
    }

    pub fn is_root(&self) -> bool {
        self.0.parents.is_empty()
    }

    /// Distribution of this node with parent values taken from `subst`.
    ///
    /// Every call builds a fresh expression, so evaluations under
    /// different substitutions never alias each other.
    pub fn distribution(&self, subst: &Substitution) -> Result<Distribution> {
        let parent_values = self
            .parents()
            .iter()
            .map(|pa| {
                subst.get(pa).cloned().ok_or_else(|| {
                    Error::Msg(format!(
                        "parent {} of {} is neither latent nor observed",
                        pa, self
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let dist = (self.0.conditional)(&parent_values)?;
        if dist.family() != self.family() {
            return Err(Error::Msg(format!(
                "{} was declared {:?} but its conditional returned {:?}",
                self,
                self.family(),
                dist.family()
            )));
        }
        Ok(dist)
    }

    /// Draw `num_samples` values, shape (S, ...). Only root nodes can be
    /// sampled directly.
    pub fn sample(&self, num_samples: usize) -> Result<Tensor> {
        if !self.is_root() {
            return Err(Error::Msg(format!(
                "cannot sample {} directly: it has {} parent(s)",
                self,
                self.parents().len()
            )));
        }
        self.distribution(&Substitution::default())?
            .sample(num_samples)
    }

    /// Element-wise log density of `value` given the parents in `subst`
    pub fn log_prob(&self, value: &Tensor, subst: &Substitution) -> Result<Tensor> {
        self.distribution(subst)?.log_prob(value)
    }

    /// Element-wise log density of a value held constant for
    /// differentiation
    pub fn log_prob_detached(&self, value: &Detached, subst: &Substitution) -> Result<Tensor> {
        self.distribution(subst)?.log_prob(value.as_tensor())
    }

    /// Entropy of a root node summed over all elements
    pub fn entropy(&self) -> Result<Tensor> {
        self.distribution(&Substitution::default())?
            .entropy()?
            .sum_all()
    }

    /// Whether `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &RandomVariable) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<&RandomVariable> = other.parents().iter().collect();
        while let Some(node) = stack.pop() {
            if node == self {
                return true;
            }
            if visited.insert(node.id()) {
                stack.extend(node.parents().iter());
            }
        }
        false
    }

    /// Members of `candidates` that descend from this node, in
    /// candidate order.
    pub fn get_descendants(&self, candidates: &[RandomVariable]) -> Vec<RandomVariable> {
        candidates
            .iter()
            .filter(|c| *c != self && self.is_ancestor_of(c))
            .cloned()
            .collect()
    }

    /// Members of `var_list` that parameterise this node, in list order
    pub fn get_variables(&self, var_list: &[Var]) -> Vec<Var> {
        var_list
            .iter()
            .filter(|v| self.0.params.contains(&v.as_tensor().id()))
            .cloned()
            .collect()
    }
}

impl PartialEq for RandomVariable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for RandomVariable {}

impl Hash for RandomVariable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for RandomVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomVariable")
            .field("name", &self.0.name)
            .field("id", &self.0.id.0)
            .field("family", &self.0.family)
            .field("parents", &self.0.parents.len())
            .finish()
    }
}

impl fmt::Display for RandomVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'#{}", self.0.name, self.0.id.0)
    }
}

/// Values bound to random variables for one Monte Carlo batch.
///
/// Latent draws have shape (S, ...); observations carry a leading unit
/// axis so they broadcast over the samples.
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    values: HashMap<RvId, Tensor>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rv: &RandomVariable, value: Tensor) -> Option<Tensor> {
        self.values.insert(rv.id(), value)
    }

    pub fn get(&self, rv: &RandomVariable) -> Option<&Tensor> {
        self.values.get(&rv.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn scalar(v: f32) -> Result<Tensor> {
        Tensor::new(&[v], &Device::Cpu)
    }

    fn child_of(name: &str, parent: &RandomVariable) -> RandomVariable {
        RandomVariable::new(name, Family::Normal, vec![parent.clone()], vec![], |pa| {
            Ok(Distribution::Normal {
                loc: pa[0].clone(),
                scale: pa[0].ones_like()?,
            })
        })
    }

    #[test]
    fn test_descendants_follow_graph() -> Result<()> {
        let a = RandomVariable::normal("a", scalar(0.0)?, scalar(1.0)?);
        let b = child_of("b", &a);
        let c = child_of("c", &b);
        let d = RandomVariable::normal("d", scalar(0.0)?, scalar(1.0)?);

        let all = vec![a.clone(), b.clone(), c.clone(), d.clone()];
        assert_eq!(a.get_descendants(&all), vec![b.clone(), c.clone()]);
        assert_eq!(b.get_descendants(&all), vec![c.clone()]);
        assert!(c.get_descendants(&all).is_empty());
        assert!(d.get_descendants(&all).is_empty());
        Ok(())
    }

    #[test]
    fn test_get_variables_filters_by_owner() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let q1 = RandomVariable::normal_variational(vb.pp("q1"), "q1", 3)?;
        let q2 = RandomVariable::normal_variational(vb.pp("q2"), "q2", 3)?;

        let all = varmap.all_vars();
        assert_eq!(all.len(), 4);
        assert_eq!(q1.get_variables(&all).len(), 2);
        assert_eq!(q2.get_variables(&all).len(), 2);

        let ids1: Vec<_> = q1.get_variables(&all).iter().map(|v| v.as_tensor().id()).collect();
        for v in q2.get_variables(&all) {
            assert!(!ids1.contains(&v.as_tensor().id()));
        }
        Ok(())
    }

    #[test]
    fn test_unbound_parent_is_an_error() -> Result<()> {
        let a = RandomVariable::normal("a", scalar(0.0)?, scalar(1.0)?);
        let b = child_of("b", &a);
        assert!(b.distribution(&Substitution::new()).is_err());
        assert!(b.sample(3).is_err());

        let mut subst = Substitution::new();
        subst.insert(&a, a.sample(3)?);
        let lp = b.log_prob(&Tensor::zeros((3, 1), DType::F32, &Device::Cpu)?, &subst)?;
        assert_eq!(lp.dims(), &[3, 1]);
        Ok(())
    }

    #[test]
    fn test_family_mismatch_is_an_error() -> Result<()> {
        let bad = RandomVariable::new("bad", Family::Bernoulli, vec![], vec![], |_| {
            Ok(Distribution::Normal {
                loc: scalar(0.0)?,
                scale: scalar(1.0)?,
            })
        });
        assert!(bad.distribution(&Substitution::new()).is_err());
        Ok(())
    }
}
