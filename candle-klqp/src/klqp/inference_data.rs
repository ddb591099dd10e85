use candle_core::{Error, Result, Tensor};

use super::random_variable::RandomVariable;

/// Mapping from model latent variables z to their approximations q(z).
///
/// Keys are unique; iteration follows insertion order so per-sample
/// accumulation is reproducible.
#[derive(Debug, Clone, Default)]
pub struct LatentVars {
    pairs: Vec<(RandomVariable, RandomVariable)>,
}

impl LatentVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(z, qz)` pairs, failing on duplicate keys
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (RandomVariable, RandomVariable)>,
    {
        let mut ret = Self::new();
        for (z, qz) in pairs {
            ret.insert(z, qz)?;
        }
        Ok(ret)
    }

    pub fn insert(&mut self, z: RandomVariable, qz: RandomVariable) -> Result<()> {
        if self.contains(&z) {
            return Err(Error::Msg(format!("latent variable {} is bound twice", z)));
        }
        self.pairs.push((z, qz));
        Ok(())
    }

    pub fn contains(&self, z: &RandomVariable) -> bool {
        self.pairs.iter().any(|(k, _)| k == z)
    }

    pub fn get(&self, z: &RandomVariable) -> Option<&RandomVariable> {
        self.pairs.iter().find(|(k, _)| k == z).map(|(_, q)| q)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RandomVariable, &RandomVariable)> {
        self.pairs.iter().map(|(z, qz)| (z, qz))
    }

    pub fn keys(&self) -> impl Iterator<Item = &RandomVariable> {
        self.pairs.iter().map(|(z, _)| z)
    }

    pub fn values(&self) -> impl Iterator<Item = &RandomVariable> {
        self.pairs.iter().map(|(_, qz)| qz)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// What an observation is attached to
#[derive(Debug, Clone)]
pub enum DataKey {
    /// an observed node of the model graph
    Node(RandomVariable),
    /// a plain identifier, read by model wrappers
    Name(Box<str>),
}

/// Observed values, in insertion order
#[derive(Debug, Clone, Default)]
pub struct Data {
    entries: Vec<(DataKey, Tensor)>,
}

impl Data {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe `value` for the graph node `x`
    pub fn observe(&mut self, x: RandomVariable, value: Tensor) -> Result<()> {
        if self.observed_value(&x).is_some() {
            return Err(Error::Msg(format!("{} is observed twice", x)));
        }
        self.entries.push((DataKey::Node(x), value));
        Ok(())
    }

    /// Attach `value` to a plain identifier
    pub fn insert_named(&mut self, name: &str, value: Tensor) {
        self.entries.push((DataKey::Name(name.into()), value));
    }

    /// Builder-style [`Data::observe`]
    pub fn with_observed(mut self, x: RandomVariable, value: Tensor) -> Result<Self> {
        self.observe(x, value)?;
        Ok(self)
    }

    /// Observed graph nodes and their values
    pub fn observed(&self) -> impl Iterator<Item = (&RandomVariable, &Tensor)> {
        self.entries.iter().filter_map(|(k, v)| match k {
            DataKey::Node(x) => Some((x, v)),
            DataKey::Name(_) => None,
        })
    }

    pub fn observed_value(&self, x: &RandomVariable) -> Option<&Tensor> {
        self.observed().find(|(k, _)| *k == x).map(|(_, v)| v)
    }

    pub fn get_named(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find_map(|(k, v)| match k {
            DataKey::Name(n) if n.as_ref() == name => Some(v),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn unit_normal(name: &str) -> Result<RandomVariable> {
        Ok(RandomVariable::normal(
            name,
            Tensor::new(&[0f32], &Device::Cpu)?,
            Tensor::new(&[1f32], &Device::Cpu)?,
        ))
    }

    #[test]
    fn test_latent_vars_reject_duplicates() -> Result<()> {
        let z = unit_normal("z")?;
        let q1 = unit_normal("q1")?;
        let q2 = unit_normal("q2")?;

        let mut lv = LatentVars::new();
        lv.insert(z.clone(), q1.clone())?;
        assert!(lv.insert(z.clone(), q2).is_err());
        assert_eq!(lv.len(), 1);
        assert_eq!(lv.get(&z), Some(&q1));
        Ok(())
    }

    #[test]
    fn test_latent_vars_keep_insertion_order() -> Result<()> {
        let zs = (0..5)
            .map(|i| unit_normal(&format!("z{}", i)))
            .collect::<Result<Vec<_>>>()?;
        let lv = LatentVars::from_pairs(zs.iter().rev().map(|z| (z.clone(), z.clone())))?;
        let keys: Vec<_> = lv.keys().cloned().collect();
        let expected: Vec<_> = zs.iter().rev().cloned().collect();
        assert_eq!(keys, expected);
        Ok(())
    }

    #[test]
    fn test_data_lookup() -> Result<()> {
        let x = unit_normal("x")?;
        let mut data = Data::new();
        data.observe(x.clone(), Tensor::new(&[2f32], &Device::Cpu)?)?;
        data.insert_named("n", Tensor::new(&[10f32], &Device::Cpu)?);

        assert!(data.observe(x.clone(), Tensor::new(&[3f32], &Device::Cpu)?).is_err());
        assert_eq!(data.observed().count(), 1);
        assert!(data.observed_value(&x).is_some());
        assert!(data.get_named("n").is_some());
        assert!(data.get_named("m").is_none());
        Ok(())
    }
}
