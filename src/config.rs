//! Target descriptions and the resolved per-target context.
//!
//! A [`TargetConfig`] is the static, per-build description (module-relative
//! gadget offsets, syscall numbers, context routines). Combined with the
//! module bases discovered at run time it resolves into a [`TargetContext`],
//! which chains and pivots borrow for the rest of the session.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::checkpoint::{ContextLayout, ContextRoutines};
use crate::error::{Error, Result};
use crate::gadget::{Gadget, GadgetTable};
use crate::syscall::SyscallTable;
use crate::types::Addr;

/// Module name → load address.
pub type ModuleBases = HashMap<String, Addr>;

/// Parse an offset or address: decimal, or hex with a `0x` prefix.
pub fn parse_u64(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u64>(),
    };
    parsed.map_err(|e| Error::Config(format!("bad number `{}`: {}", s, e)))
}

/// Parse a `name=address` module base argument.
pub fn parse_base_arg(arg: &str) -> Result<(String, Addr)> {
    let (name, addr) = arg
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("expected NAME=ADDR, got `{}`", arg)))?;
    if name.is_empty() {
        return Err(Error::Config(format!("empty module name in `{}`", arg)));
    }
    Ok((name.to_string(), Addr(parse_u64(addr)?)))
}

fn de_offset<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(v) => Ok(v),
        Raw::Text(s) => parse_u64(&s).map_err(serde::de::Error::custom),
    }
}

/// Location of a gadget inside a module.
#[derive(Debug, Clone, Deserialize)]
pub struct GadgetEntry {
    pub module: String,
    #[serde(deserialize_with = "de_offset")]
    pub offset: u64,
}

/// Module-relative offsets of the context capture/resume routine pair.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub module: String,
    #[serde(deserialize_with = "de_offset")]
    pub save: u64,
    #[serde(deserialize_with = "de_offset")]
    pub resume: u64,
    #[serde(default)]
    pub layout: ContextLayout,
}

fn default_true() -> bool {
    true
}

/// Static description of one target build.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub gadgets: BTreeMap<Gadget, GadgetEntry>,
    /// Extra or overriding syscall numbers.
    #[serde(default)]
    pub syscalls: BTreeMap<String, u64>,
    /// Start from the built-in Linux x86_64 syscall table.
    #[serde(default = "default_true")]
    pub builtin_syscalls: bool,
    #[serde(default)]
    pub context: Option<ContextEntry>,
}

impl TargetConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Module names referenced anywhere in the config.
    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gadgets.values().map(|e| e.module.as_str()).collect();
        if let Some(ctx) = &self.context {
            names.push(ctx.module.as_str());
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Everything a chain needs to know about its target, resolved once.
#[derive(Debug, Clone)]
pub struct TargetContext {
    name: String,
    gadgets: GadgetTable,
    syscalls: SyscallTable,
    context: Option<ContextRoutines>,
}

impl TargetContext {
    pub fn new(
        name: impl Into<String>,
        gadgets: GadgetTable,
        syscalls: SyscallTable,
        context: Option<ContextRoutines>,
    ) -> Self {
        Self {
            name: name.into(),
            gadgets,
            syscalls,
            context,
        }
    }

    /// Resolve `config` against the discovered module `bases`.
    pub fn resolve(config: &TargetConfig, bases: &ModuleBases) -> Result<Self> {
        let gadgets = GadgetTable::resolve(
            config
                .gadgets
                .iter()
                .map(|(&g, e)| (g, e.module.as_str(), e.offset)),
            bases,
        )?;

        let mut syscalls = if config.builtin_syscalls {
            SyscallTable::linux_x86_64()
        } else {
            SyscallTable::new()
        };
        syscalls.extend(config.syscalls.iter().map(|(n, &nr)| (n.clone(), nr)));

        let context = match &config.context {
            Some(entry) => {
                entry.layout.validate()?;
                let base = bases
                    .get(&entry.module)
                    .ok_or_else(|| Error::UnknownModule(entry.module.clone()))?;
                Some(ContextRoutines {
                    save: *base + entry.save,
                    resume: *base + entry.resume,
                    layout: entry.layout,
                })
            }
            None => None,
        };

        log::debug!(
            "target `{}`: {} gadgets, {} syscalls, context routines: {}",
            config.name,
            gadgets.len(),
            syscalls.len(),
            context.is_some()
        );

        Ok(Self::new(config.name.clone(), gadgets, syscalls, context))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gadget(&self, gadget: Gadget) -> Result<Addr> {
        self.gadgets.get(gadget)
    }

    pub fn gadgets(&self) -> &GadgetTable {
        &self.gadgets
    }

    pub fn syscall_number(&self, name: &str) -> Result<u64> {
        self.syscalls.number(name)
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    pub fn context_routines(&self) -> Result<&ContextRoutines> {
        self.context
            .as_ref()
            .ok_or_else(|| Error::Config(format!("target `{}` has no context routines", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "sample",
        "gadgets": {
            "pop_rdi": { "module": "libc", "offset": "0x2a3e5" },
            "ret":     { "module": "libc", "offset": 10 },
            "syscall": { "module": "libkernel", "offset": "0x1_0000" }
        },
        "syscalls": { "getuid": 24, "jitshm_create": 533 },
        "context": {
            "module": "libkernel",
            "save": "0x4000",
            "resume": "0x4100",
            "layout": { "size": 200, "rip_offset": 0, "rsp_offset": 16 }
        }
    }"#;

    fn bases() -> ModuleBases {
        let mut b = ModuleBases::new();
        b.insert("libc".into(), Addr(0x7f00_0000_0000));
        b.insert("libkernel".into(), Addr(0x8_0000_0000));
        b
    }

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_u64("0x10").unwrap(), 16);
        assert_eq!(parse_u64("0X7f_00").unwrap(), 0x7f00);
        assert_eq!(parse_u64("42").unwrap(), 42);
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn parse_base() {
        let (name, addr) = parse_base_arg("libc=0x7f0000000000").unwrap();
        assert_eq!(name, "libc");
        assert_eq!(addr, Addr(0x7f00_0000_0000));
        assert!(parse_base_arg("libc").is_err());
        assert!(parse_base_arg("=0x10").is_err());
    }

    #[test]
    fn load_and_resolve() {
        let cfg = TargetConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.modules(), vec!["libc", "libkernel"]);

        let target = TargetContext::resolve(&cfg, &bases()).unwrap();
        assert_eq!(target.name(), "sample");
        assert_eq!(target.gadget(Gadget::PopRdi).unwrap(), Addr(0x7f00_0002_a3e5));
        assert_eq!(target.gadget(Gadget::Ret).unwrap(), Addr(0x7f00_0000_000a));
        assert_eq!(target.gadget(Gadget::Syscall).unwrap(), Addr(0x8_0001_0000));
        assert!(target.gadget(Gadget::PopRsp).is_err());

        assert_eq!(target.syscall_number("getuid").unwrap(), 24);
        assert_eq!(target.syscall_number("jitshm_create").unwrap(), 533);
        assert_eq!(target.syscall_number("read").unwrap(), 0);

        let ctx = target.context_routines().unwrap();
        assert_eq!(ctx.save, Addr(0x8_0000_4000));
        assert_eq!(ctx.resume, Addr(0x8_0000_4100));
        assert_eq!(ctx.layout.size, 200);
        assert_eq!(ctx.layout.rsp_offset, 16);
    }

    #[test]
    fn missing_module_base() {
        let cfg = TargetConfig::from_json(SAMPLE).unwrap();
        let mut b = bases();
        b.remove("libkernel");
        assert!(matches!(TargetContext::resolve(&cfg, &b), Err(Error::UnknownModule(m)) if m == "libkernel"));
    }

    #[test]
    fn builtin_syscalls_can_be_disabled() {
        let cfg = TargetConfig::from_json(
            r#"{ "name": "bare", "builtin_syscalls": false, "syscalls": { "getuid": 24 } }"#,
        )
        .unwrap();
        let target = TargetContext::resolve(&cfg, &ModuleBases::new()).unwrap();
        assert!(target.syscall_number("read").is_err());
        assert_eq!(target.syscall_number("getuid").unwrap(), 24);
        assert!(target.context_routines().is_err());
    }

    #[test]
    fn unknown_gadget_name_rejected() {
        let err = TargetConfig::from_json(
            r#"{ "name": "x", "gadgets": { "pop_rbx": { "module": "libc", "offset": 1 } } }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn shipped_emulated_target_is_complete() {
        let cfg = TargetConfig::from_json(include_str!("../targets/emulated.json")).unwrap();
        let target = TargetContext::resolve(&cfg, &bases()).unwrap();
        assert!(target.gadgets().missing().is_empty());
        assert_eq!(target.context_routines().unwrap().layout, ContextLayout::default());
    }

    #[test]
    fn context_layout_outside_buffer_rejected() {
        let cfg = TargetConfig::from_json(
            r#"{
                "name": "bad-layout",
                "context": {
                    "module": "libc", "save": 1, "resume": 2,
                    "layout": { "size": 16, "rip_offset": 0, "rsp_offset": 16 }
                }
            }"#,
        )
        .unwrap();
        assert!(matches!(TargetContext::resolve(&cfg, &bases()), Err(Error::Config(_))));
    }
}
