//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Conditions under which a declaration variant holds.
//!
//! Headers branch on the target with `#ifdef WIN32`, `#if SIZEOF_LONG == 8` and friends.
//! Instead of resolving those to a single branch, the closure is parsed once per
//! configured platform and each declaration variant is tagged with the platforms it was
//! seen on.  The emitter turns that tag back into a `#[cfg(...)]`.
use proc_macro2::TokenStream;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A named platform and the Rust `cfg` predicate that selects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub name: String,
    /// e.g. `all(target_os = "linux", target_arch = "x86_64")`
    pub cfg: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", content = "platforms", rename_all = "snake_case")]
pub enum Condition {
    /// Holds on every parsed platform
    Always,
    Platform(String),
    Any(Vec<String>),
}

impl Condition {
    /// The condition covering `members` out of `all` platforms, both in configuration order.
    pub fn covering(members: &[&str], all: &[PlatformInfo]) -> Condition {
        if members.len() == all.len() {
            Condition::Always
        } else if let [only] = members {
            Condition::Platform(only.to_string())
        } else {
            Condition::Any(members.iter().map(|m| m.to_string()).collect())
        }
    }

    pub fn platforms(&self) -> Vec<&str> {
        match self {
            Condition::Always => Vec::new(),
            Condition::Platform(p) => vec![p.as_str()],
            Condition::Any(ps) => ps.iter().map(String::as_str).collect(),
        }
    }

    /// The `#[cfg(...)]` attribute for this condition, or nothing for [`Condition::Always`].
    pub fn to_cfg_attr(&self, platforms: &[PlatformInfo]) -> Result<TokenStream, CfgError> {
        let predicate = |name: &str| -> Result<TokenStream, CfgError> {
            let info = platforms
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| CfgError::UnknownPlatform(name.to_string()))?;
            TokenStream::from_str(&info.cfg)
                .map_err(|_| CfgError::Malformed(info.name.clone(), info.cfg.clone()))
        };

        match self {
            Condition::Always => Ok(TokenStream::new()),
            Condition::Platform(name) => {
                let pred = predicate(name)?;
                Ok(quote::quote! { #[cfg(#pred)] })
            }
            Condition::Any(names) => {
                let preds = names.iter().map(|n| predicate(n)).collect::<Result<Vec<_>, _>>()?;
                Ok(quote::quote! { #[cfg(any(#(#preds),*))] })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    #[error("condition names platform `{0}`, which was never parsed")]
    UnknownPlatform(String),
    #[error("platform `{0}` has a malformed cfg predicate `{1}`")]
    Malformed(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platforms() -> Vec<PlatformInfo> {
        vec![
            PlatformInfo { name: "linux".into(), cfg: r#"target_os = "linux""#.into() },
            PlatformInfo { name: "macos".into(), cfg: r#"target_os = "macos""#.into() },
            PlatformInfo { name: "windows".into(), cfg: "windows".into() },
        ]
    }

    #[test]
    fn covering_collapses_to_always() {
        let all = platforms();
        assert_eq!(Condition::covering(&["linux", "macos", "windows"], &all), Condition::Always);
        assert_eq!(Condition::covering(&["macos"], &all), Condition::Platform("macos".into()));
        assert_eq!(
            Condition::covering(&["linux", "macos"], &all),
            Condition::Any(vec!["linux".into(), "macos".into()])
        );
    }

    #[test]
    fn cfg_attrs() {
        let all = platforms();
        assert!(Condition::Always.to_cfg_attr(&all).unwrap().is_empty());
        let attr = Condition::Platform("windows".into()).to_cfg_attr(&all).unwrap();
        assert_eq!(attr.to_string(), "# [cfg (windows)]");
        let attr = Condition::Any(vec!["linux".into(), "macos".into()]).to_cfg_attr(&all).unwrap();
        assert_eq!(
            attr.to_string(),
            r#"# [cfg (any (target_os = "linux" , target_os = "macos"))]"#
        );
    }

    #[test]
    fn unknown_platform_is_an_error() {
        let err = Condition::Platform("beos".into()).to_cfg_attr(&platforms()).unwrap_err();
        assert!(matches!(err, CfgError::UnknownPlatform(p) if p == "beos"));
    }
}
