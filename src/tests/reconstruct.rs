//! Receive-side reconstruction against a hand-laid slot buffer.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::mempool::PoolBuf;
use crate::message::{decode_key, encode_key, Message, Meta};
use crate::transport::reconstruct;
use crate::util::math::{align_ceil, page_size};
use crate::util::page_alloc::{alloc_slab, PageAlloc};
use crate::van::BufferContext;
use crate::wire::MAX_DATA_FIELDS;

/// Lay out a slot buffer exactly as the write path does: packed meta at
/// offset zero, push-request values at the next page boundary.
fn filled_slot(meta: &Meta, values: Option<&[u8]>) -> (PageAlloc, Arc<BufferContext>) {
    let page = page_size();
    let mem = alloc_slab(page + values.map_or(0, |v| v.len()));

    let meta_len = meta.packed_len();
    // SAFETY: the slab is larger than one page plus the payload.
    let buf = unsafe { std::slice::from_raw_parts_mut(mem.ptr, mem.len) };
    meta.pack(buf);

    let mut data_len = [0usize; MAX_DATA_FIELDS];
    let data_num = if let Some(values) = values {
        let offset = align_ceil(meta_len, page);
        buf[offset..offset + values.len()].copy_from_slice(values);
        data_len = [8, values.len(), 4, 0];
        3
    } else {
        0
    };

    let bc = Arc::new(BufferContext {
        buffer: PoolBuf::new(NonNull::new(mem.ptr).unwrap(), mem.len, None),
        meta_len,
        data_num,
        data_len,
    });
    (mem, bc)
}

#[test]
fn push_request_values_survive_byte_for_byte() {
    let values: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();

    let meta = Meta {
        push: true,
        request: true,
        key: 3,
        val_len: values.len() as i32,
        body: b"framework blob".to_vec(),
        ..Meta::default()
    };
    let (_mem, bc) = filled_slot(&meta, Some(&values));

    let mut msg = Message::default();
    msg.meta = Meta::unpack(unsafe {
        std::slice::from_raw_parts(bc.buffer.as_ptr(), bc.buffer.len())
    });

    let n = reconstruct::push_request(&mut msg, &bc, page_size());
    assert_eq!(n, 8 + values.len() + 4);
    assert_eq!(msg.data.len(), 3);

    // SAFETY: segments point into live test buffers.
    unsafe {
        assert_eq!(msg.data[0].as_slice(), &encode_key(3)[..]);
        assert_eq!(msg.data[1].as_slice(), &values[..]);
        assert_eq!(
            msg.data[2].as_slice(),
            &(values.len() as i32).to_le_bytes()[..]
        );
    }
    assert_eq!(decode_key(unsafe { msg.data[0].as_slice() }), 3);
}

#[test]
fn pull_response_points_at_the_application_buffer() {
    // The worker's own value buffer, filled by the server's write.
    let app_buf: Vec<u8> = vec![0x5a; 1024];

    let meta = Meta {
        push: false,
        request: false,
        key: 11,
        addr: app_buf.as_ptr() as u64,
        val_len: app_buf.len() as i32,
        ..Meta::default()
    };
    let (_mem, bc) = filled_slot(&meta, None);

    let mut msg = Message::default();
    msg.meta = meta;

    let n = reconstruct::pull_response(&mut msg, &bc);
    assert_eq!(n, 8 + 1024 + 4);
    assert_eq!(msg.data[1].as_ptr() as usize, app_buf.as_ptr() as usize);
    assert_eq!(msg.data[1].len(), 1024);
    // SAFETY: points at `app_buf`.
    assert_eq!(unsafe { msg.data[1].as_slice() }, &app_buf[..]);
}

#[test]
fn pull_request_gets_the_shape_the_kv_app_expects() {
    let meta = Meta {
        push: false,
        request: true,
        key: 7,
        ..Meta::default()
    };
    let (_mem, bc) = filled_slot(&meta, None);

    let mut msg = Message::default();
    msg.meta = meta;

    let n = reconstruct::pull_request(&mut msg, &bc);
    assert_eq!(n, 8);
    assert_eq!(msg.data.len(), 2);
    assert!(msg.data[1].is_empty());
}

#[test]
fn push_response_is_meta_only() {
    let meta = Meta {
        push: true,
        request: false,
        ..Meta::default()
    };
    let (_mem, bc) = filled_slot(&meta, None);

    let mut msg = Message::default();
    msg.meta = meta;

    assert_eq!(reconstruct::push_response(&mut msg, &bc), 0);
    assert!(msg.data.is_empty());
}
