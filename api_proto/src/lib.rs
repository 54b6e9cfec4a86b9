//! Generated Kubernetes CRI bindings, compiled from `proto/runtime/v1/api.proto`
//! by `tonic-build` in `build.rs`.

pub mod runtime {
    pub mod v1 {
        tonic::include_proto!("runtime.v1");
    }
}
