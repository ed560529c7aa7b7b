//LICENSE Portions Copyright 2019-2021 ZomboDB, LLC.
//LICENSE
//LICENSE Portions Copyright 2021-2023 Technology Concepts & Design, Inc.
//LICENSE
//LICENSE Portions Copyright 2023-2023 PgCentral Foundation, Inc. <contact@pgcentral.org>
//LICENSE
//LICENSE All rights reserved.
//LICENSE
//LICENSE Use of this source code is governed by the MIT license that can be found in the LICENSE file.
//! Version-scoped Postgres header extraction and Rust binding generation.
//!
//! A [`HeaderSetRegistry`] maps each supported Postgres major version to the headers that
//! make up its FFI surface.  The [`Extractor`] parses one set's closure with libclang into a
//! [`DeclarationIr`], and the [`Emitter`] lowers that IR through an ordered [`RuleSet`] into
//! a single Rust module.  [`generate`] runs all three.
pub mod condition;
pub mod config;
pub mod emit;
pub mod env;
pub mod extract;
pub mod headers;
pub mod ir;
pub mod pipeline;
pub mod probe;

pub use condition::{Condition, PlatformInfo};
pub use config::{GenerateConfig, Platform};
pub use emit::rules::{Action, Decision, FilterRule, RuleSet};
pub use emit::{EmitReport, EmittedModule, Emitter, LowerError, LowerErrorKind};
pub use env::{BuildEnvironment, EnvironmentError};
pub use extract::{ExtractError, Extractor};
pub use headers::{HeaderSetRegistry, SelectError, VersionedHeaderSet};
pub use ir::DeclarationIr;
pub use pipeline::{generate, GenerateError, GeneratedBindings};
pub use probe::{LayoutProbe, ProbeError};
