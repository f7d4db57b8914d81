//! Raw libfabric bindings plus the C shim wrapping the static-inline call
//! surface.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

use std::os::raw::{c_int, c_void};

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));

extern "C" {
    pub fn fi_shim_version() -> u32;
    pub fn fi_shim_eagain() -> c_int;
    pub fn fi_shim_eavail() -> c_int;
    pub fn fi_shim_ecanceled() -> c_int;
    pub fn fi_shim_addr_unspec() -> fi_addr_t;
    pub fn fi_shim_allocinfo() -> *mut fi_info;
    pub fn fi_shim_domain(
        fabric: *mut fid_fabric,
        info: *mut fi_info,
        dom: *mut *mut fid_domain,
    ) -> c_int;
    pub fn fi_shim_endpoint(
        dom: *mut fid_domain,
        info: *mut fi_info,
        ep: *mut *mut fid_ep,
    ) -> c_int;
    pub fn fi_shim_cq_open(
        dom: *mut fid_domain,
        attr: *mut fi_cq_attr,
        cq: *mut *mut fid_cq,
    ) -> c_int;
    pub fn fi_shim_av_open(
        dom: *mut fid_domain,
        attr: *mut fi_av_attr,
        av: *mut *mut fid_av,
    ) -> c_int;
    pub fn fi_shim_ep_bind(ep: *mut fid_ep, fid: *mut fid, flags: u64) -> c_int;
    pub fn fi_shim_enable(ep: *mut fid_ep) -> c_int;
    pub fn fi_shim_close(fid: *mut fid) -> c_int;
    pub fn fi_shim_av_insert(
        av: *mut fid_av,
        addr: *const c_void,
        count: usize,
        fi_addr: *mut fi_addr_t,
    ) -> c_int;
    pub fn fi_shim_getname(fid: *mut fid, addr: *mut c_void, addrlen: *mut usize) -> c_int;
    pub fn fi_shim_tsend(
        ep: *mut fid_ep,
        buf: *const c_void,
        len: usize,
        desc: *mut c_void,
        dest_addr: fi_addr_t,
        tag: u64,
        context: *mut c_void,
    ) -> isize;
    pub fn fi_shim_trecv(
        ep: *mut fid_ep,
        buf: *mut c_void,
        len: usize,
        desc: *mut c_void,
        src_addr: fi_addr_t,
        tag: u64,
        ignore: u64,
        context: *mut c_void,
    ) -> isize;
    pub fn fi_shim_tinject(
        ep: *mut fid_ep,
        buf: *const c_void,
        len: usize,
        dest_addr: fi_addr_t,
        tag: u64,
    ) -> isize;
    pub fn fi_shim_cq_read(cq: *mut fid_cq, buf: *mut c_void, count: usize) -> isize;
    pub fn fi_shim_cq_readerr(cq: *mut fid_cq, buf: *mut fi_cq_err_entry, flags: u64) -> isize;
    pub fn fi_shim_cancel(fid: *mut fid, context: *mut c_void) -> c_int;
    pub fn fi_shim_mr_reg(
        dom: *mut fid_domain,
        buf: *const c_void,
        len: usize,
        access: u64,
        mr: *mut *mut fid_mr,
    ) -> c_int;
    pub fn fi_shim_mr_desc(mr: *mut fid_mr) -> *mut c_void;
    pub fn fi_shim_mr_key(mr: *mut fid_mr) -> u64;
}
