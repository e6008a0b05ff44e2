//! Global object factory.
//!
//! Maps type-name strings to component constructors. The registry is built
//! once and immutable afterward, so cloned simulations and contingency
//! workers share it without synchronization.

use crate::component::{Component, ComponentKind};
use crate::models::{Area, Bus, Exciter, Generator, Governor, Link, Load, Relay};
use crate::sources::{
    CommSource, ConstantSource, FileSource, FunctionSource, GrabberSource, PulseSource,
    RampSource, RandomSource, SineSource, Source,
};
use once_cell::sync::Lazy;
use std::collections::HashMap;

type Constructor = fn() -> ComponentKind;

static REGISTRY: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Constructor> = HashMap::new();
    map.insert("area", || ComponentKind::Area(Area::default()));
    map.insert("bus", || ComponentKind::Bus(Bus::default()));
    map.insert("link", || ComponentKind::Link(Link::default()));
    map.insert("line", || ComponentKind::Link(Link::default()));
    map.insert("generator", || {
        ComponentKind::Generator(Generator::default())
    });
    map.insert("governor", || ComponentKind::Governor(Governor::default()));
    map.insert("exciter", || ComponentKind::Exciter(Exciter::default()));
    map.insert("load", || ComponentKind::Load(Load::default()));
    map.insert("relay", || ComponentKind::Relay(Relay::default()));
    map.insert("source", || {
        ComponentKind::Source(Source::Constant(ConstantSource::default()))
    });
    map.insert("constantsource", || {
        ComponentKind::Source(Source::Constant(ConstantSource::default()))
    });
    map.insert("rampsource", || {
        ComponentKind::Source(Source::Ramp(RampSource::default()))
    });
    map.insert("pulsesource", || {
        ComponentKind::Source(Source::Pulse(PulseSource::default()))
    });
    map.insert("sinesource", || {
        ComponentKind::Source(Source::Sine(SineSource::default()))
    });
    map.insert("filesource", || {
        ComponentKind::Source(Source::File(FileSource::default()))
    });
    map.insert("randomsource", || {
        ComponentKind::Source(Source::Random(RandomSource::default()))
    });
    map.insert("functionsource", || {
        ComponentKind::Source(Source::Function(FunctionSource::default()))
    });
    map.insert("grabbersource", || {
        ComponentKind::Source(Source::Grabber(GrabberSource::default()))
    });
    map.insert("commsource", || {
        ComponentKind::Source(Source::Comm(CommSource::default()))
    });
    map
});

/// Construct a component of the named type, or `None` for unknown names.
pub fn create_object(type_name: &str, object_name: &str) -> Option<Component> {
    let ctor = REGISTRY.get(type_name.to_ascii_lowercase().as_str())?;
    Some(Component::new(object_name, ctor()))
}

/// The registered type names.
pub fn registered_types() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_types() {
        for name in ["bus", "link", "generator", "load", "relay", "pulsesource"] {
            let comp = create_object(name, "obj").expect("known type");
            assert_eq!(comp.base.name, "obj");
        }
    }

    #[test]
    fn test_case_insensitive() {
        assert!(create_object("BUS", "b").is_some());
        assert!(create_object("SineSource", "s").is_some());
    }

    #[test]
    fn test_unknown_type() {
        assert!(create_object("flywheel", "x").is_none());
    }

    #[test]
    fn test_registry_lists_types() {
        let names = registered_types();
        assert!(names.contains(&"bus"));
        assert!(names.contains(&"randomsource"));
    }
}
