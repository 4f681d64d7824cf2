//! A pluggable volume provisioner for Kubernetes.
//!
//! Cluster operators declare a Provisioner object whose spec holds templated
//! definitions of short-lived helper pods that validate, create, delete,
//! stage, and unstage storage volumes. This crate translates volume
//! lifecycle requests arriving over the CSI contract into sequences of
//! helper-pod runs, tracking progress through per-claim and per-mount state
//! machines stored as annotations on the cluster's own objects.

pub mod agent;
pub mod config;
pub mod csi;
pub mod kubernetes;
pub mod pod;
pub mod provisioner;
pub mod state;
pub mod template;
