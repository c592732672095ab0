//! Mapping from child pods back to their owning Cat

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use crate::cat::{Cat, KIND};

/// The Cat controlling `pod`, if any.
///
/// Only the controller owner reference counts, and only when it points at a
/// `Cat` of this API version. The Cat is assumed to live in the pod's namespace.
pub fn owning_cat(pod: &Pod) -> Option<ObjectRef<Cat>> {
    let owner = pod
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))?;

    if owner.api_version != Cat::api_version() || owner.kind != KIND {
        return None;
    }

    let mut cat = ObjectRef::new(&owner.name);
    if let Some(ns) = pod.namespace() {
        cat = cat.within(&ns);
    }
    Some(cat)
}

/// Controller owner reference put on every pod created for `cat`
pub fn owner_reference(cat: &Cat) -> Option<OwnerReference> {
    let mut owner = cat.controller_owner_ref(&())?;
    owner.block_owner_deletion = Some(true);
    Some(owner)
}
