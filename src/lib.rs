#![deny(unused_variables)]
//! Linear-time derivatives of CTMC substitution-model likelihoods on trees.
//!
//! The crate is organised leaves-first: an array-backed [`tree::Tree`], generator
//! models in [`substmodel`], a reference likelihood engine in [`engine`], and the
//! derivative delegates in [`treedatalikelihood`] that turn pre/post-order partials
//! into per-branch and whole-tree statistics. [`gradient`] assembles those statistics
//! into parameter-space gradients, [`transform`] maps node heights onto ratios, and
//! [`maximize`] drives BFGS and the Laplace approximation on top of any provider.

#[path = "../tree/mod.rs"]
pub mod tree;

#[path = "../substmodel/mod.rs"]
pub mod substmodel;

#[path = "../alignment/mod.rs"]
pub mod alignment;

#[path = "../engine/mod.rs"]
pub mod engine;

#[path = "../branchrates/mod.rs"]
pub mod branchrates;

#[path = "../treedatalikelihood/mod.rs"]
pub mod treedatalikelihood;

#[path = "../gradient/mod.rs"]
pub mod gradient;

#[path = "../transform/mod.rs"]
pub mod transform;

#[path = "../maximize/mod.rs"]
pub mod maximize;

#[path = "../config/mod.rs"]
pub mod config;
