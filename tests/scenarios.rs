// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end scenarios: hand-assembled WebAssembly binaries driven through
//! decode, validation, and the interpreter.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nostrscript::Module;
use nostrscript::core_compat::alloc::Global;
use nostrscript::core_compat::vec::Vec as CVec;
use nostrscript::exec::{
    Builtin, BuiltinContext, BuiltinOutcome, Interpreter, Limits, RunOutcome, Trap, Value,
};

const I32: u8 = 0x7f;

fn leb_u32(mut v: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
    out
}

// Signed LEB128, shared by i32.const and i64.const immediates: the encoding
// only depends on the mathematical value, so sign-extending an i32 into an
// i64 before encoding yields the same bytes as encoding the i32 directly.
fn leb_i64(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        let done = (v == 0 && (byte & 0x40) == 0) || (v == -1 && (byte & 0x40) != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
    out
}

fn name_bytes(s: &str) -> Vec<u8> {
    let mut out = leb_u32(s.len() as u32);
    out.extend_from_slice(s.as_bytes());
    out
}

fn encode_vec(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = leb_u32(items.len() as u32);
    for item in items {
        out.extend(item);
    }
    out
}

fn section(id: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(leb_u32(body.len() as u32));
    out.extend(body);
    out
}

fn module_bytes(sections: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
    for s in sections {
        out.extend(s);
    }
    out
}

fn functype(params: &[u8], results: &[u8]) -> Vec<u8> {
    let mut out = vec![0x60];
    out.extend(leb_u32(params.len() as u32));
    out.extend_from_slice(params);
    out.extend(leb_u32(results.len() as u32));
    out.extend_from_slice(results);
    out
}

// A function body: `locals` is a list of (count, valtype) compressed groups.
fn function_entry(locals: &[(u32, u8)], code: &[u8]) -> Vec<u8> {
    let mut body = leb_u32(locals.len() as u32);
    for (count, valtype) in locals {
        body.extend(leb_u32(*count));
        body.push(*valtype);
    }
    body.extend_from_slice(code);
    let mut out = leb_u32(body.len() as u32);
    out.extend(body);
    out
}

fn decode(bytes: &[u8]) -> Module<Global> {
    let module = Module::decode(Cursor::new(bytes), Global).expect("decode");
    module.validate().expect("validate");
    module
}

fn no_builtins() -> CVec<Builtin<Global>, Global> {
    CVec::new_in(Global)
}

#[test]
fn s1_add_two_constants() {
    let typesec = section(1, encode_vec(vec![functype(&[], &[I32])]));
    let funcsec = section(3, encode_vec(vec![leb_u32(0)]));
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00); // ExportDescriptor::Function
        entry.extend(leb_u32(0));
        encode_vec(vec![entry])
    });
    let code = {
        let mut c = vec![0x41];
        c.extend(leb_i64(2)); // i32.const 2
        c.push(0x41);
        c.extend(leb_i64(3)); // i32.const 3
        c.push(0x6a); // i32.add
        c.push(0x0b); // end
        c
    };
    let codesec = section(10, encode_vec(vec![function_entry(&[], &code)]));

    let bytes = module_bytes(vec![typesec, funcsec, exportsec, codesec]);
    let module = decode(&bytes);

    let mut interp =
        Interpreter::instantiate(&module, no_builtins(), Limits::default(), Global).unwrap();
    match interp.run().unwrap() {
        RunOutcome::Completed(Some(Value::I32(v))) => assert_eq!(v, 5),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn s2_local_loop_sum() {
    let typesec = section(1, encode_vec(vec![functype(&[], &[I32])]));
    let funcsec = section(3, encode_vec(vec![leb_u32(0)]));
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00);
        entry.extend(leb_u32(0));
        encode_vec(vec![entry])
    });

    // (local i32 i32) ;; i=local0, sum=local1
    // i32.const 0 local.set 0
    // i32.const 0 local.set 1
    // loop
    //   local.get 1 local.get 0 i32.add local.set 1
    //   local.get 0 i32.const 1 i32.add local.tee 0
    //   i32.const 10 i32.lt_s br_if 0
    // end
    // local.get 1 end
    let mut code = Vec::new();
    code.extend([0x41, 0x00, 0x21, 0x00]); // i32.const 0; local.set 0
    code.extend([0x41, 0x00, 0x21, 0x01]); // i32.const 0; local.set 1
    code.extend([0x03, 0x40]); // loop (empty blocktype)
    code.extend([0x20, 0x01, 0x20, 0x00, 0x6a, 0x21, 0x01]); // local.get 1; local.get 0; i32.add; local.set 1
    code.extend([0x20, 0x00, 0x41, 0x01, 0x6a, 0x22, 0x00]); // local.get 0; i32.const 1; i32.add; local.tee 0
    code.extend([0x41, 0x0a, 0x48, 0x0d, 0x00]); // i32.const 10; i32.lt_s; br_if 0
    code.push(0x0b); // end (loop)
    code.extend([0x20, 0x01]); // local.get 1
    code.push(0x0b); // end (function)

    let codesec = section(
        10,
        encode_vec(vec![function_entry(&[(2, I32)], &code)]),
    );

    let bytes = module_bytes(vec![typesec, funcsec, exportsec, codesec]);
    let module = decode(&bytes);

    let mut interp =
        Interpreter::instantiate(&module, no_builtins(), Limits::default(), Global).unwrap();
    match interp.run().unwrap() {
        RunOutcome::Completed(Some(Value::I32(v))) => assert_eq!(v, 45),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn s3_memory_copy_trap() {
    let typesec = section(1, encode_vec(vec![functype(&[], &[])]));
    let funcsec = section(3, encode_vec(vec![leb_u32(0)]));
    let memsec = section(5, encode_vec(vec![vec![0x00, 0x01]])); // 1 page, no max
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00);
        entry.extend(leb_u32(0));
        encode_vec(vec![entry])
    });
    let datasec = section(11, {
        let mut entry = vec![0x00]; // DataSegmentToken::ActiveNoMemIdx
        entry.extend([0x41, 0x00, 0x0b]); // offset: i32.const 0; end
        entry.extend(leb_u32(4));
        entry.extend([1, 2, 3, 4]);
        encode_vec(vec![entry])
    });

    let mut code = Vec::new();
    code.extend([0x41]);
    code.extend(leb_i64(65533)); // i32.const 65533 (dst)
    code.extend([0x41, 0x00]); // i32.const 0 (src)
    code.extend([0x41, 0x04]); // i32.const 4 (len)
    code.extend([0xfc]);
    code.extend(leb_u32(10)); // memory.copy
    code.extend([0x00, 0x00]); // reserved memidx bytes
    code.push(0x0b); // end

    let codesec = section(10, encode_vec(vec![function_entry(&[], &code)]));

    let bytes = module_bytes(vec![typesec, funcsec, memsec, exportsec, codesec, datasec]);
    let module = decode(&bytes);

    // Instantiation succeeds: the data segment initializer is a direct copy
    // into the backing bytes, not a guest load/store, so offset 0 is a
    // plain, usable address for it. The later `memory.copy` reads through
    // address 0, which this implementation reserves as a null sentinel for
    // guest-observable accesses, so that's what it traps on rather than the
    // out-of-range write.
    let mut interp =
        Interpreter::instantiate(&module, no_builtins(), Limits::default(), Global).unwrap();
    assert!(matches!(interp.run(), Err(Trap::NullMemoryAccess)));

    // Re-instantiating resets memory to its initial, segment-applied
    // contents: running the same module again traps identically rather than
    // compounding on whatever the first run left behind.
    let mut interp2 =
        Interpreter::instantiate(&module, no_builtins(), Limits::default(), Global).unwrap();
    assert!(matches!(interp2.run(), Err(Trap::NullMemoryAccess)));
}

#[test]
fn s4_indirect_dispatch() {
    // type 0: (i32) -> i32, shared by both table functions.
    // type 1: () -> i32, the caller.
    let typesec = section(
        1,
        encode_vec(vec![functype(&[I32], &[I32]), functype(&[], &[I32])]),
    );
    let funcsec = section(3, encode_vec(vec![leb_u32(0), leb_u32(0), leb_u32(1)]));
    let tablesec = section(4, encode_vec(vec![vec![0x70, 0x00, 0x02]])); // funcref, min 2
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00);
        entry.extend(leb_u32(2));
        encode_vec(vec![entry])
    });
    let elemsec = section(9, {
        let mut entry = vec![0x00]; // ElementSegmentToken::ActiveElemIndices
        entry.extend([0x41, 0x00, 0x0b]); // offset: i32.const 0; end
        entry.extend(leb_u32(2));
        entry.extend(leb_u32(0)); // func 0 -> slot 0
        entry.extend(leb_u32(1)); // func 1 -> slot 1
        encode_vec(vec![entry])
    });

    // func 0: squares its argument.
    let squared = {
        let mut c = vec![0x20, 0x00, 0x20, 0x00, 0x6c];
        c.push(0x0b);
        c
    };
    // func 1: adds one to its argument.
    let plus_one = {
        let mut c = vec![0x20, 0x00, 0x41, 0x01, 0x6a];
        c.push(0x0b);
        c
    };
    // func 2 (_start): pushes 5, picks slot 1 (plus_one), calls indirectly.
    let main = {
        let mut c = vec![0x41, 0x05, 0x41, 0x01, 0x11, 0x00, 0x00];
        c.push(0x0b);
        c
    };
    let codesec = section(
        10,
        encode_vec(vec![
            function_entry(&[], &squared),
            function_entry(&[], &plus_one),
            function_entry(&[], &main),
        ]),
    );

    let bytes = module_bytes(vec![
        typesec, funcsec, tablesec, exportsec, elemsec, codesec,
    ]);
    let module = decode(&bytes);

    let mut interp =
        Interpreter::instantiate(&module, no_builtins(), Limits::default(), Global).unwrap();
    match interp.run().unwrap() {
        RunOutcome::Completed(Some(Value::I32(v))) => assert_eq!(v, 6),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

static YIELD_CALLED: AtomicBool = AtomicBool::new(false);

fn yield_builtin(ctx: &mut BuiltinContext<'_, '_, Global>) -> Result<BuiltinOutcome, Trap> {
    if YIELD_CALLED.swap(true, Ordering::SeqCst) {
        ctx.set_result(Value::I32(42));
        Ok(BuiltinOutcome::Done)
    } else {
        Ok(BuiltinOutcome::Suspend)
    }
}

#[test]
fn s5_host_builtin_suspend_resume() {
    YIELD_CALLED.store(false, Ordering::SeqCst);

    let typesec = section(1, encode_vec(vec![functype(&[], &[I32])]));
    let importsec = section(2, {
        let mut entry = name_bytes("env");
        entry.extend(name_bytes("yield"));
        entry.push(0x00); // ImportDescriptor::Function
        entry.extend(leb_u32(0));
        encode_vec(vec![entry])
    });
    let funcsec = section(3, encode_vec(vec![leb_u32(0)]));
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00);
        entry.extend(leb_u32(1)); // function index 1: the locally defined function
        encode_vec(vec![entry])
    });
    let code = {
        let mut c = vec![0x10];
        c.extend(leb_u32(0)); // call 0 (imported yield)
        c.extend([0x41, 0x01]); // i32.const 1
        c.push(0x6a); // i32.add
        c.push(0x0b); // end
        c
    };
    let codesec = section(10, encode_vec(vec![function_entry(&[], &code)]));

    let bytes = module_bytes(vec![typesec, importsec, funcsec, exportsec, codesec]);
    let module = decode(&bytes);

    let mut builtins = no_builtins();
    builtins.push(Builtin { name: "yield", func: yield_builtin });

    let mut interp =
        Interpreter::instantiate(&module, builtins, Limits::default(), Global).unwrap();
    assert!(matches!(interp.run().unwrap(), RunOutcome::Suspended));
    match interp.resume().unwrap() {
        RunOutcome::Completed(Some(Value::I32(v))) => assert_eq!(v, 43),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

static DOUBLE_CALLED: AtomicBool = AtomicBool::new(false);
static DOUBLE_ARG_ON_RESUME: AtomicI32 = AtomicI32::new(0);

fn double_builtin(ctx: &mut BuiltinContext<'_, '_, Global>) -> Result<BuiltinOutcome, Trap> {
    if DOUBLE_CALLED.swap(true, Ordering::SeqCst) {
        let Some(Value::I32(arg)) = ctx.arg(0) else {
            panic!("missing i32 argument on resume");
        };
        DOUBLE_ARG_ON_RESUME.store(arg, Ordering::SeqCst);
        ctx.set_result(Value::I32(arg * 2));
        Ok(BuiltinOutcome::Done)
    } else {
        Ok(BuiltinOutcome::Suspend)
    }
}

#[test]
fn s5b_host_builtin_suspend_resume_preserves_args() {
    // A suspending builtin must not lose its operands: the same `call` is
    // re-dispatched on resume, so the argument the first (suspending)
    // invocation saw must still be on the value stack for the second.
    DOUBLE_CALLED.store(false, Ordering::SeqCst);
    DOUBLE_ARG_ON_RESUME.store(0, Ordering::SeqCst);

    let typesec = section(
        1,
        encode_vec(vec![functype(&[I32], &[I32]), functype(&[], &[I32])]),
    );
    let importsec = section(2, {
        let mut entry = name_bytes("env");
        entry.extend(name_bytes("double"));
        entry.push(0x00); // ImportDescriptor::Function
        entry.extend(leb_u32(0)); // typeidx 0: (i32) -> i32
        encode_vec(vec![entry])
    });
    let funcsec = section(3, encode_vec(vec![leb_u32(1)])); // typeidx 1: () -> i32
    let exportsec = section(7, {
        let mut entry = name_bytes("_start");
        entry.push(0x00);
        entry.extend(leb_u32(1)); // function index 1: the locally defined function
        encode_vec(vec![entry])
    });
    let code = {
        let mut c = vec![0x41, 0x07]; // i32.const 7
        c.push(0x10);
        c.extend(leb_u32(0)); // call 0 (imported double)
        c.extend([0x41, 0x01]); // i32.const 1
        c.push(0x6a); // i32.add
        c.push(0x0b); // end
        c
    };
    let codesec = section(10, encode_vec(vec![function_entry(&[], &code)]));

    let bytes = module_bytes(vec![typesec, importsec, funcsec, exportsec, codesec]);
    let module = decode(&bytes);

    let mut builtins = no_builtins();
    builtins.push(Builtin { name: "double", func: double_builtin });

    let mut interp =
        Interpreter::instantiate(&module, builtins, Limits::default(), Global).unwrap();
    assert!(matches!(interp.run().unwrap(), RunOutcome::Suspended));
    match interp.resume().unwrap() {
        RunOutcome::Completed(Some(Value::I32(v))) => assert_eq!(v, 15),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(DOUBLE_ARG_ON_RESUME.load(Ordering::SeqCst), 7);
}
