//! Raw MPI bindings plus safe accessors for the macro constants the C shim
//! exposes as functions.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

use std::os::raw::c_int;

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

extern "C" {
    fn tc_shim_success() -> c_int;
    fn tc_shim_undefined() -> c_int;
    fn tc_shim_any_source() -> c_int;
    fn tc_shim_thread_funneled() -> c_int;
    fn tc_shim_thread_multiple() -> c_int;
    fn tc_shim_comm_type_shared() -> c_int;
    fn tc_shim_tag_ub_key() -> c_int;
    fn tc_shim_comm_world() -> MPI_Comm;
    fn tc_shim_byte() -> MPI_Datatype;
    fn tc_shim_int() -> MPI_Datatype;
    fn tc_shim_info_null() -> MPI_Info;
    fn tc_shim_request_null() -> MPI_Request;
}

pub fn tc_success() -> c_int {
    unsafe { tc_shim_success() }
}

pub fn tc_undefined() -> c_int {
    unsafe { tc_shim_undefined() }
}

pub fn tc_any_source() -> c_int {
    unsafe { tc_shim_any_source() }
}

pub fn tc_thread_funneled() -> c_int {
    unsafe { tc_shim_thread_funneled() }
}

pub fn tc_thread_multiple() -> c_int {
    unsafe { tc_shim_thread_multiple() }
}

pub fn tc_comm_type_shared() -> c_int {
    unsafe { tc_shim_comm_type_shared() }
}

pub fn tc_tag_ub_key() -> c_int {
    unsafe { tc_shim_tag_ub_key() }
}

pub fn tc_comm_world() -> MPI_Comm {
    unsafe { tc_shim_comm_world() }
}

pub fn tc_byte() -> MPI_Datatype {
    unsafe { tc_shim_byte() }
}

pub fn tc_int() -> MPI_Datatype {
    unsafe { tc_shim_int() }
}

pub fn tc_info_null() -> MPI_Info {
    unsafe { tc_shim_info_null() }
}

pub fn tc_request_null() -> MPI_Request {
    unsafe { tc_shim_request_null() }
}
