mod common;

use common::{config, read_cell, scratch, Dso, DF_1_NOOPEN};
use rtld::{DlHandle, DlInfoRequest, DlInfoValue, DlopenMode, ErrorClass, ModuleId, Rtld};

fn refcounts(rtld: &Rtld, id: ModuleId) -> (usize, usize) {
    match rtld.dlinfo(id, DlInfoRequest::RefCounts).unwrap() {
        DlInfoValue::RefCounts {
            refcount,
            opencount,
        } => (refcount, opencount),
        other => panic!("unexpected dlinfo answer {:?}", other),
    }
}

fn loaded(rtld: &Rtld, name: &str) -> bool {
    rtld.with_context(|ctx| ctx.find_loaded(name).is_some())
}

fn module_count(rtld: &Rtld) -> usize {
    rtld.with_context(|ctx| ctx.modules().count())
}

#[test]
fn same_file_loads_once() {
    let dir = scratch("same-file");
    let path = Dso::new("libx.so").data("x", 7).write(&dir, "libx.so");
    let link = dir.join("liby.so");
    std::os::unix::fs::symlink(&path, &link).unwrap();

    let rtld = Rtld::new(config(&[&dir]));
    let a = rtld
        .dlopen(path.to_str(), DlopenMode::NOW)
        .unwrap();
    let b = rtld.dlopen(link.to_str(), DlopenMode::NOW).unwrap();
    let c = rtld.dlopen(Some("libx.so"), DlopenMode::LAZY).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert_eq!(module_count(&rtld), 1);
    assert_eq!(refcounts(&rtld, a), (3, 3));

    let x = rtld.dlsym(DlHandle::Module(a), "x").unwrap();
    assert_eq!(read_cell(x), 7);

    rtld.dlclose(a).unwrap();
    rtld.dlclose(a).unwrap();
    assert!(loaded(&rtld, "libx.so"));
    rtld.dlclose(a).unwrap();
    assert!(!loaded(&rtld, "libx.so"));
    assert_eq!(module_count(&rtld), 0);
    assert!(rtld.dlclose(a).is_err());
}

#[test]
fn dependencies_share_references() {
    let dir = scratch("shared-deps");
    Dso::new("libdep.so").data("dep_value", 11).write(&dir, "libdep.so");
    let top = Dso::new("libtop.so")
        .needs("libdep.so")
        .data("top_value", 1)
        .write(&dir, "libtop.so");

    let rtld = Rtld::new(config(&[&dir]));
    let t = rtld.dlopen(top.to_str(), DlopenMode::NOW).unwrap();
    let d = rtld.dlopen(Some("libdep.so"), DlopenMode::NOW).unwrap();
    assert_eq!(refcounts(&rtld, t), (1, 1));
    assert_eq!(refcounts(&rtld, d), (2, 1));

    // The dependency is visible through its dependent's handle.
    let v = rtld.dlsym(DlHandle::Module(t), "dep_value").unwrap();
    assert_eq!(read_cell(v), 11);
    assert!(rtld.dlsym(DlHandle::Module(d), "top_value").is_err());

    rtld.dlclose(t).unwrap();
    assert!(!loaded(&rtld, "libtop.so"));
    assert!(loaded(&rtld, "libdep.so"));
    assert_eq!(refcounts(&rtld, d), (1, 1));
    rtld.dlclose(d).unwrap();
    assert_eq!(module_count(&rtld), 0);
}

#[test]
fn failed_open_leaves_nothing_behind() {
    let dir = scratch("rollback");
    Dso::new("libgood.so").data("good", 1).write(&dir, "libgood.so");
    let bad = Dso::new("libbad.so")
        .needs("libgood.so")
        .needs("libmissing.so")
        .write(&dir, "libbad.so");

    let rtld = Rtld::new(config(&[&dir]));
    let err = rtld.dlopen(bad.to_str(), DlopenMode::NOW).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Format);
    assert_eq!(module_count(&rtld), 0);
    let msg = rtld.dlerror().unwrap();
    assert!(msg.contains("libmissing.so"), "{}", msg);

    // What the failed open pulled in can still be loaded on its own.
    let good = rtld.dlopen(Some("libgood.so"), DlopenMode::NOW).unwrap();
    assert_eq!(refcounts(&rtld, good), (1, 1));
}

#[test]
fn unresolved_reference_is_rolled_back() {
    let dir = scratch("unresolved");
    let lib = Dso::new("libneedy.so")
        .data("slot", 0)
        .undef("nowhere_to_be_found")
        .reloc("slot", common::RelocKind::GlobDat, Some("nowhere_to_be_found"), 0)
        .write(&dir, "libneedy.so");

    let rtld = Rtld::new(config(&[&dir]));
    let err = rtld.dlopen(lib.to_str(), DlopenMode::NOW).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Relocation);
    assert!(err.message().contains("nowhere_to_be_found"));
    assert_eq!(module_count(&rtld), 0);
}

#[test]
fn failed_dependency_leaves_resident_modules_alone() {
    let dir = scratch("partial-rollback");
    let good = Dso::new("libgood.so").data("good", 5).write(&dir, "libgood.so");
    Dso::new("libneedy.so")
        .data("slot", 0)
        .undef("nowhere_to_be_found")
        .reloc("slot", common::RelocKind::GlobDat, Some("nowhere_to_be_found"), 0)
        .write(&dir, "libneedy.so");
    let bad = Dso::new("libbad.so")
        .needs("libgood.so")
        .needs("libneedy.so")
        .write(&dir, "libbad.so");

    let rtld = Rtld::new(config(&[&dir]));
    let g = rtld.dlopen(good.to_str(), DlopenMode::NOW).unwrap();
    let before = module_count(&rtld);

    let err = rtld.dlopen(bad.to_str(), DlopenMode::NOW).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Relocation);
    assert_eq!(module_count(&rtld), before);
    assert!(!loaded(&rtld, "libbad.so"));
    assert!(!loaded(&rtld, "libneedy.so"));
    assert_eq!(refcounts(&rtld, g), (1, 1));
    let v = rtld.dlsym(DlHandle::Module(g), "good").unwrap();
    assert_eq!(read_cell(v), 5);

    rtld.dlclose(g).unwrap();
    assert_eq!(module_count(&rtld), 0);
}

#[test]
fn version_requirements_are_checked() {
    let dir = scratch("verneed");
    let mut provider = Dso::new("libv.so").versioned_func("f", 0x1000_0001, "V1", false);
    provider.versions = vec!["V1".to_string()];
    provider.write(&dir, "libv.so");
    let wants_v2 = Dso::new("libwants2.so")
        .needs("libv.so")
        .versioned_undef("f", "libv.so", "V2")
        .write(&dir, "libwants2.so");
    let wants_v1 = Dso::new("libwants1.so")
        .needs("libv.so")
        .versioned_undef("f", "libv.so", "V1")
        .write(&dir, "libwants1.so");

    let rtld = Rtld::new(config(&[&dir]));
    let err = rtld.dlopen(wants_v2.to_str(), DlopenMode::NOW).unwrap_err();
    assert!(err.message().contains("V2"), "{}", err.message());
    assert_eq!(module_count(&rtld), 0);

    let ok = rtld.dlopen(wants_v1.to_str(), DlopenMode::NOW).unwrap();
    assert_eq!(
        rtld.dlvsym(DlHandle::Module(ok), "f", "V1").unwrap(),
        0x1000_0001
    );
}

#[test]
fn rpath_wins_over_default_paths() {
    let top_dir = scratch("rpath");
    let rpath_dir = top_dir.join("r");
    std::fs::create_dir_all(&rpath_dir).unwrap();
    let default_dir = scratch("rpath-default");
    Dso::new("libdup.so").data("which", 1).write(&rpath_dir, "libdup.so");
    Dso::new("libdup.so").data("which", 2).write(&default_dir, "libdup.so");

    let mut with_rpath = Dso::new("libtop.so").needs("libdup.so");
    with_rpath.rpath = Some("$ORIGIN/r".to_string());
    let with_rpath = with_rpath.write(&top_dir, "libtop.so");
    let plain = Dso::new("libplain.so")
        .needs("libdup.so")
        .write(&top_dir, "libplain.so");

    let mut conf = config(&[]);
    conf.default_paths = vec![default_dir.display().to_string()];

    let rtld = Rtld::new(conf.clone());
    let h = rtld.dlopen(with_rpath.to_str(), DlopenMode::NOW).unwrap();
    let which = rtld.dlsym(DlHandle::Module(h), "which").unwrap();
    assert_eq!(read_cell(which), 1);
    match rtld.dlinfo(h, DlInfoRequest::SearchPaths).unwrap() {
        DlInfoValue::SearchPaths(dirs) => {
            assert_eq!(dirs.first(), Some(&rpath_dir.display().to_string()))
        }
        other => panic!("unexpected dlinfo answer {:?}", other),
    }

    let rtld = Rtld::new(conf);
    let h = rtld.dlopen(plain.to_str(), DlopenMode::NOW).unwrap();
    let which = rtld.dlsym(DlHandle::Module(h), "which").unwrap();
    assert_eq!(read_cell(which), 2);
}

#[test]
fn library_path_wins_over_runpath() {
    let top_dir = scratch("runpath");
    let run_dir = scratch("runpath-run");
    let env_dir = scratch("runpath-env");
    Dso::new("libdup.so").data("which", 1).write(&run_dir, "libdup.so");
    Dso::new("libdup.so").data("which", 2).write(&env_dir, "libdup.so");
    let mut top = Dso::new("libtop.so").needs("libdup.so");
    top.runpath = Some(run_dir.display().to_string());
    let top = top.write(&top_dir, "libtop.so");

    let rtld = Rtld::new(config(&[&env_dir]));
    let h = rtld.dlopen(top.to_str(), DlopenMode::NOW).unwrap();
    let which = rtld.dlsym(DlHandle::Module(h), "which").unwrap();
    assert_eq!(read_cell(which), 2);
}

#[test]
fn noload_only_finds_resident_modules() {
    let dir = scratch("noload");
    let path = Dso::new("libn.so").data("n", 3).write(&dir, "libn.so");

    let rtld = Rtld::new(config(&[&dir]));
    let err = rtld
        .dlopen(Some("libn.so"), DlopenMode::NOW | DlopenMode::NOLOAD)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Resolution);
    assert_eq!(module_count(&rtld), 0);

    let h = rtld.dlopen(path.to_str(), DlopenMode::NOW).unwrap();
    let again = rtld
        .dlopen(Some("libn.so"), DlopenMode::NOW | DlopenMode::NOLOAD)
        .unwrap();
    assert_eq!(h, again);
    assert_eq!(refcounts(&rtld, h).1, 2);
}

#[test]
fn noopen_objects_are_refused() {
    let dir = scratch("noopen");
    let mut lib = Dso::new("libclosed.so").data("c", 1);
    lib.flags_1 = DF_1_NOOPEN;
    let path = lib.write(&dir, "libclosed.so");

    let rtld = Rtld::new(config(&[&dir]));
    assert!(rtld.dlopen(path.to_str(), DlopenMode::NOW).is_err());
    assert_eq!(module_count(&rtld), 0);
}

#[test]
fn nodelete_keeps_modules_mapped() {
    let dir = scratch("nodelete");
    let path = Dso::new("libstay.so").data("s", 5).write(&dir, "libstay.so");

    let rtld = Rtld::new(config(&[&dir]));
    let h = rtld
        .dlopen(path.to_str(), DlopenMode::NOW | DlopenMode::NODELETE)
        .unwrap();
    rtld.dlclose(h).unwrap();
    assert!(loaded(&rtld, "libstay.so"));
    let s = rtld.dlsym(DlHandle::Module(h), "s").unwrap();
    assert_eq!(read_cell(s), 5);
}

#[test]
fn modules_are_introspectable() {
    let dir = scratch("introspect");
    Dso::new("libleaf.so").data("leaf", 1).write(&dir, "libleaf.so");
    let path = Dso::new("libintro.so")
        .needs("libleaf.so")
        .data("first", 10)
        .data("second", 20)
        .write(&dir, "libintro.so");

    let rtld = Rtld::new(config(&[&dir]));
    let h = rtld.dlopen(path.to_str(), DlopenMode::NOW).unwrap();

    let second = rtld.dlsym(DlHandle::Module(h), "second").unwrap();
    let info = rtld.dladdr(second + 4).unwrap();
    assert_eq!(info.fname, path);
    assert_eq!(info.sname.as_deref(), Some("second"));
    assert_eq!(info.saddr, second);
    assert!(info.fbase <= second);
    assert!(rtld.dladdr(0x10).is_err());

    let bias = match rtld.dlinfo(h, DlInfoRequest::LinkMap).unwrap() {
        DlInfoValue::LinkMap(map) => {
            assert_eq!(map.name, path);
            assert!(map.dynamic.is_some());
            map.addr
        }
        other => panic!("unexpected dlinfo answer {:?}", other),
    };
    assert_eq!(bias, info.fbase);
    assert_eq!(
        rtld.dlinfo(h, DlInfoRequest::Origin).unwrap(),
        DlInfoValue::Origin(dir.clone())
    );
    assert_eq!(
        rtld.dlinfo(h, DlInfoRequest::TlsModId).unwrap(),
        DlInfoValue::TlsModId(0)
    );

    let mut names = vec![];
    let ret = rtld.dl_iterate_phdr(|rec| {
        names.push(rec.name.clone());
        assert_eq!(rec.phnum, 2);
        assert_ne!(rec.phdr, 0);
        0
    });
    assert_eq!(ret, 0);
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with("libintro.so"));

    let mut calls = 0;
    assert_eq!(
        rtld.dl_iterate_phdr(|_| {
            calls += 1;
            7
        }),
        7
    );
    assert_eq!(calls, 1);
}
