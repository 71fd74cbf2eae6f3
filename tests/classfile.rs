mod common;

use common::*;
use jvm_probe_weaver::classfile::{
    ClassFile, ClassFileError, CodeSubAttribute, CpInfo, MethodAttribute, StackMapFrame,
};
use jvm_probe_weaver::config::InstrumentConfig;
use jvm_probe_weaver::pass::ClassInstrumentor;

/// A class with one field, a constructor carrying every decoded `Code`
/// sub-attribute, a native method and a spread of raw attributes.
fn build_test_class() -> Vec<u8> {
    let mut cp = CpBuilder::new();
    let class_test = cp.class("Test");
    let class_object = cp.class("java/lang/Object");
    let _mref_object_init = cp.methodref("java/lang/Object", "<init>", "()V");

    let utf_init = cp.utf8("<init>");
    let utf_void = cp.utf8("()V");
    let utf_native = cp.utf8("poke");
    let utf_field_name = cp.utf8("value");
    let utf_int_desc = cp.utf8("I");
    let const_int = cp.integer(123);
    let _const_long = cp.long(1 << 40);
    let utf_nul = cp.utf8("nul\u{0}inside");

    let utf_code = cp.utf8("Code");
    let utf_lnt = cp.utf8("LineNumberTable");
    let utf_lvt = cp.utf8("LocalVariableTable");
    let utf_lvtt = cp.utf8("LocalVariableTypeTable");
    let utf_smt = cp.utf8("StackMapTable");
    let utf_source_file = cp.utf8("SourceFile");
    let utf_source_name = cp.utf8("Test.java");
    let utf_signature = cp.utf8("Signature");
    let utf_signature_val = cp.utf8("Ljava/lang/Object;");
    let utf_exceptions = cp.utf8("Exceptions");
    let utf_constant_value = cp.utf8("ConstantValue");
    let utf_unknown = cp.utf8("UnknownAttr");
    let utf_this = cp.utf8("this");

    let cp_count = (cp.entries.len() + 1) as u16;

    let mut bytes = Vec::new();
    u4(&mut bytes, 0xCAFEBABE);
    u2(&mut bytes, 0);
    u2(&mut bytes, 52);
    u2(&mut bytes, cp_count);
    for entry in &cp.entries {
        bytes.extend_from_slice(entry);
    }

    u2(&mut bytes, 0x0021);
    u2(&mut bytes, class_test);
    u2(&mut bytes, class_object);
    u2(&mut bytes, 0);

    u2(&mut bytes, 1);
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, utf_field_name);
    u2(&mut bytes, utf_int_desc);
    u2(&mut bytes, 1);
    let mut cv_info = Vec::new();
    u2(&mut cv_info, const_int);
    push_attr(&mut bytes, utf_constant_value, &cv_info);

    u2(&mut bytes, 2);

    // <init>: return, with every typed sub-attribute
    u2(&mut bytes, 0x0001);
    u2(&mut bytes, utf_init);
    u2(&mut bytes, utf_void);
    let mut method_attrs = Vec::new();
    let mut code_info = Vec::new();
    u2(&mut code_info, 1);
    u2(&mut code_info, 1);
    u4(&mut code_info, 1);
    u1(&mut code_info, 0xb1);
    u2(&mut code_info, 0);

    let mut code_sub_attrs = Vec::new();
    let mut lnt_info = Vec::new();
    u2(&mut lnt_info, 1);
    u2(&mut lnt_info, 0);
    u2(&mut lnt_info, 1);
    push_attr(&mut code_sub_attrs, utf_lnt, &lnt_info);

    let mut lvt_info = Vec::new();
    u2(&mut lvt_info, 1);
    u2(&mut lvt_info, 0);
    u2(&mut lvt_info, 1);
    u2(&mut lvt_info, utf_this);
    u2(&mut lvt_info, utf_signature_val);
    u2(&mut lvt_info, 0);
    push_attr(&mut code_sub_attrs, utf_lvt, &lvt_info);

    let mut lvtt_info = Vec::new();
    u2(&mut lvtt_info, 1);
    u2(&mut lvtt_info, 0);
    u2(&mut lvtt_info, 1);
    u2(&mut lvtt_info, utf_this);
    u2(&mut lvtt_info, utf_signature_val);
    u2(&mut lvtt_info, 0);
    push_attr(&mut code_sub_attrs, utf_lvtt, &lvtt_info);

    let mut smt_info = Vec::new();
    u2(&mut smt_info, 2);
    u1(&mut smt_info, 0);
    u1(&mut smt_info, 251);
    u2(&mut smt_info, 3);
    push_attr(&mut code_sub_attrs, utf_smt, &smt_info);

    push_attr(&mut code_sub_attrs, utf_unknown, b"code-level");

    u2(&mut code_info, 5);
    code_info.extend_from_slice(&code_sub_attrs);
    push_attr(&mut method_attrs, utf_code, &code_info);

    let mut exc_info = Vec::new();
    u2(&mut exc_info, 1);
    u2(&mut exc_info, class_object);
    push_attr(&mut method_attrs, utf_exceptions, &exc_info);

    u2(&mut bytes, 2);
    bytes.extend_from_slice(&method_attrs);

    // native poke()V
    u2(&mut bytes, 0x0101);
    u2(&mut bytes, utf_native);
    u2(&mut bytes, utf_void);
    u2(&mut bytes, 0);

    let mut class_attrs = Vec::new();
    let mut sf_info = Vec::new();
    u2(&mut sf_info, utf_source_name);
    push_attr(&mut class_attrs, utf_source_file, &sf_info);
    let mut sig_info = Vec::new();
    u2(&mut sig_info, utf_signature_val);
    push_attr(&mut class_attrs, utf_signature, &sig_info);
    let mut unknown_info = Vec::new();
    u2(&mut unknown_info, utf_nul);
    push_attr(&mut class_attrs, utf_unknown, &unknown_info);

    u2(&mut bytes, 3);
    bytes.extend_from_slice(&class_attrs);

    bytes
}

#[test]
fn parses_code_sub_attributes() {
    let bytes = build_test_class();
    let classfile = ClassFile::parse(&bytes).expect("parse class file");

    assert_eq!(classfile.class_name().unwrap(), "Test");
    assert_eq!(classfile.fields.len(), 1);
    assert_eq!(classfile.attributes.len(), 3);

    let init = &classfile.methods[0];
    assert_eq!(classfile.method_name(init).unwrap(), "<init>");
    assert!(init.attributes.iter().any(|a| matches!(a, MethodAttribute::Other(_))));
    let code = init.code().expect("code attr");
    assert_eq!(code.code, vec![0xb1]);

    assert!(code.attributes.iter().any(|a| matches!(a, CodeSubAttribute::LineNumberTable { .. })));
    assert!(code.attributes.iter().any(|a| matches!(a, CodeSubAttribute::LocalVariableTable { .. })));
    assert!(code.attributes.iter().any(|a| matches!(a, CodeSubAttribute::LocalVariableTypeTable { .. })));
    assert!(code.attributes.iter().any(|a| matches!(a, CodeSubAttribute::Other(_))));
    let frames = code
        .attributes
        .iter()
        .find_map(|a| match a {
            CodeSubAttribute::StackMapTable { entries, .. } => Some(entries),
            _ => None,
        })
        .expect("stack map table");
    assert_eq!(
        frames,
        &vec![StackMapFrame::Same { offset_delta: 0 }, StackMapFrame::SameExtended { offset_delta: 3 }]
    );

    assert!(classfile.methods[1].code().is_none());
}

#[test]
fn unmodified_class_round_trips_byte_for_byte() {
    let bytes = build_test_class();
    let classfile = ClassFile::parse(&bytes).unwrap();
    assert_eq!(classfile.to_bytes().unwrap(), bytes);
}

#[test]
fn constant_pool_keeps_long_slots_and_nul_strings() {
    let classfile = ClassFile::parse(&build_test_class()).unwrap();
    let cp = &classfile.constant_pool;

    let (long_index, _) = cp.iter().find(|(_, e)| matches!(e, CpInfo::Long(_))).unwrap();
    assert!(cp.get(long_index + 1).is_err());
    assert!(cp.iter().any(|(_, e)| matches!(e, CpInfo::Utf8(s) if s.as_str() == "nul\u{0}inside")));
}

/// `static String odd()` returning a constant whose Utf8 body is `text`.
fn class_with_odd_string(text: &[u8]) -> Vec<u8> {
    let mut b = ClassBuilder::new("Odd");
    let utf8 = b.cp.raw_utf8(text);
    let string = b.cp.string(utf8);
    // ldc #string; areturn
    let code = vec![0x12, string as u8, 0xb0];
    b.method(0x0008, "odd", "()Ljava/lang/String;", Some(Code::new(1, 0, code)));
    b.build()
}

#[test]
fn lone_surrogates_and_overlong_forms_round_trip() {
    for text in [&[0xED, 0xA0, 0x80][..], &[b'a', 0xC1, 0x81][..]] {
        let bytes = class_with_odd_string(text);
        let classfile = ClassFile::parse(&bytes).unwrap();
        assert_eq!(classfile.to_bytes().unwrap(), bytes);
    }
}

#[test]
fn class_with_lone_surrogate_is_instrumented() {
    let bytes = class_with_odd_string(&[0xED, 0xA0, 0x80]);
    let out = ClassInstrumentor::new(InstrumentConfig::default()).instrument_class(&bytes).unwrap();
    assert_eq!(out.report.instrumented.len(), 1);

    let classfile = ClassFile::parse(&out.bytes).unwrap();
    let kept = classfile.constant_pool.iter().any(|(_, e)| {
        matches!(e, CpInfo::Utf8(s) if s.as_bytes() == [0xED, 0xA0, 0x80] && s.as_str() == "\u{FFFD}")
    });
    assert!(kept);
}

#[test]
fn interning_reuses_existing_entries() {
    let mut classfile = ClassFile::parse(&build_test_class()).unwrap();
    let before = classfile.constant_pool.count();

    let index = classfile.constant_pool.method_ref("java/lang/Object", "<init>", "()V").unwrap();
    assert_eq!(classfile.constant_pool.count(), before);
    let m = classfile.constant_pool.member_ref(index).unwrap();
    assert_eq!((m.owner, m.name, m.descriptor), ("java/lang/Object", "<init>", "()V"));

    classfile.constant_pool.string("fresh").unwrap();
    assert_eq!(classfile.constant_pool.count(), before + 2);
}

#[test]
fn constant_pool_refuses_to_overflow() {
    let mut b = ClassBuilder::new("Full");
    for i in 0..(65_534 - b.cp.entries.len()) {
        b.cp.integer(i as i32);
    }
    let mut classfile = ClassFile::parse(&b.build()).unwrap();
    let cp = &mut classfile.constant_pool;

    assert_eq!(cp.count(), 65_535);
    assert!(cp.integer(7).is_ok());
    assert_eq!(cp.integer(-1), Err(ClassFileError::ConstantPoolFull));
    assert_eq!(cp.count(), 65_535);
}

#[test]
fn rejects_malformed_input() {
    let bytes = build_test_class();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = 0;
    assert!(matches!(ClassFile::parse(&bad_magic), Err(ClassFileError::InvalidMagic(_))));

    assert_eq!(ClassFile::parse(&bytes[..bytes.len() - 1]).unwrap_err(), ClassFileError::UnexpectedEof);

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert_eq!(ClassFile::parse(&trailing).unwrap_err(), ClassFileError::TrailingBytes(1));
}
