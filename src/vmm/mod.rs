pub mod completion;
pub mod exit;
pub mod kvm_ctx;
pub mod memory;
pub mod registers;
pub mod vcpu;
pub mod vm;
pub mod vmx;
