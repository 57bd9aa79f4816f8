//! State mapping behavior: slicing, aliasing, composition, merging, and
//! serialization round trips.

use grackle::il::{self, cst, cst_s, mem, reg, slc_named, vec as disj, Endian, Expression};
use grackle::memory::AliasPolicy;
use grackle::state::{merge, State};

fn logging() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

fn aliasing() -> State {
    State::new(Endian::Little, AliasPolicy::Aliasing)
}

fn no_aliasing() -> State {
    State::new(Endian::Little, AliasPolicy::NoAliasing)
}

#[test]
fn register_slices_read_and_write_independently() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let xl = slc_named(x.clone(), 0, 8, "xl").unwrap();
    let xh = slc_named(x.clone(), 8, 8, "xh").unwrap();

    m.write(&x, cst(0xabcdef89, 32)).unwrap();
    assert_eq!(m.eval(&xl).unwrap(), cst(0x89, 8));
    assert_eq!(m.eval(&xh).unwrap(), cst(0xef, 8));

    m.write(&xl, y.slice(8, 16).unwrap()).unwrap();
    assert_eq!(m.eval(&xl).unwrap(), y.slice(8, 16).unwrap());
    assert_eq!(m.eval(&xh).unwrap(), cst(0xef, 8));
    assert_eq!(
        m.eval(&x.slice(16, 32).unwrap()).unwrap(),
        cst(0xabcd, 16)
    );

    m.write(&xh, y.slice(0, 8).unwrap()).unwrap();
    assert_eq!(m.eval(&xl).unwrap(), y.slice(8, 16).unwrap());
    assert_eq!(m.eval(&xh).unwrap(), y.slice(0, 8).unwrap());
    assert_eq!(
        m.eval(&x.slice(16, 32).unwrap()).unwrap(),
        cst(0xabcd, 16)
    );
}

#[test]
fn possibly_aliased_reads_carry_candidate_writes() {
    logging();
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let mx = mem(x.clone(), 32).unwrap();
    let my = mem(y.clone(), 32).unwrap();
    let mxx = mem(x.clone() + cst(2, 32), 32).unwrap();

    m.write(&mx, cst(0xdeadbeef, 32)).unwrap();
    m.write(&my, cst(0xbabebabe, 32)).unwrap();
    m.write(&mxx, cst(0x01234567, 32)).unwrap();

    // the newest write covers the whole window, older aliases are shadowed
    assert_eq!(m.eval(&mxx).unwrap(), cst(0x01234567, 32));

    // [y] may alias both stores through x
    let ry = m.eval(&my).unwrap();
    assert!(ry.mods().is_some());

    let rx = m.eval(&mx).unwrap();
    let mods = rx.mods().expect("ambiguous read");
    assert_eq!(mods.len(), 3);
    assert_eq!(mods[0].0, il::ptr(x.clone(), 2));
    assert_eq!(mods[1].0, il::ptr(y.clone(), 0));
    assert_eq!(mods[2].1, cst(0xdeadbeef, 32));
}

#[test]
fn candidate_chains_follow_the_write_log() {
    logging();
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let z = reg("z", 32);
    let w = reg("w", 32);
    let r = reg("r", 32);
    let a = reg("a", 32);
    let b = reg("b", 32);
    let mx = mem(x.clone(), 32).unwrap();
    let my = mem(y.clone(), 32).unwrap();

    m.write(&r, mx.clone()).unwrap(); // mov  r  , [x]
    m.write(&mx, cst(0, 32)).unwrap(); // mov [x] , 0
    assert_eq!(m.eval(&r).unwrap(), mx);
    assert_eq!(m.eval(&mx).unwrap(), cst(0, 32));

    m.write(&my, cst(1, 32)).unwrap(); // mov [y] , 1
    assert_eq!(m.eval(&my).unwrap(), cst(1, 32));
    let rx = m.eval(&mx).unwrap();
    assert_eq!(rx.mods().map(|mods| mods.len()), Some(2));

    m.write(&z, r.clone()).unwrap(); // mov  z  , r
    assert_eq!(m.eval(&z).unwrap(), mx);
    m.write(&w, my.clone()).unwrap(); // mov  w  , [y]
    assert_eq!(m.eval(&w).unwrap(), cst(1, 32));

    m.write(&a, a.clone() + mx.clone()).unwrap(); // add  a  , [x]
    match m.eval(&a).unwrap() {
        Expression::Op { rhs, .. } => {
            let mods = rhs.mods().expect("ambiguous read");
            assert_eq!(mods[0].0, il::ptr(y.clone(), 0));
        }
        e => panic!("expected an addition, got {}", e),
    }

    m.write(&mx, cst(2, 32)).unwrap(); // mov [x] , 2
    m.write(&my, z.clone()).unwrap(); // mov [y] , z
    m.write(&b, b.clone() + mx.clone()).unwrap(); // add  b  , [x]
    match m.eval(&b).unwrap() {
        Expression::Op { rhs, .. } => {
            assert_eq!(rhs.mods().map(|mods| mods.len()), Some(2));
        }
        e => panic!("expected an addition, got {}", e),
    }

    m.write(&mem(a.clone(), 32).unwrap(), cst(0, 32)).unwrap(); // mov [a] , 0
}

#[test]
fn reads_spanning_same_base_writes_compose_resolved_slices() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let a = reg("a", 32);

    m.write(&mem(x.clone() - cst(4, 32), 32).unwrap(), cst(0x44434241, 32))
        .unwrap();
    m.write(&mem(x.clone() - cst(8, 32), 32).unwrap(), y.clone())
        .unwrap();
    m.write(&x, x.clone() - cst(8, 32)).unwrap();

    let window = mem(x.clone() + cst(2, 32), 32).unwrap();
    let res = m.eval(&window).unwrap();
    assert_eq!(res.slice(16, 32).unwrap(), cst(0x4241, 16));
    assert_eq!(res.slice(0, 16).unwrap(), y.slice(16, 32).unwrap());

    m.write(&mem(a.clone(), 8).unwrap(), cst(0xcc, 8)).unwrap();
    let res = m.eval(&window).unwrap();
    assert_eq!(res.mods().map(|mods| mods.len()), Some(3));

    // binding the unrelated base resolves the ambiguous byte
    let mut prev = aliasing();
    prev.write(&a, x.clone() - cst(4, 32)).unwrap();
    let res = prev.eval(&res).unwrap();
    assert_eq!(res.slice(16, 24).unwrap(), cst(0xcc, 8));
}

#[test]
fn composition_uses_direct_bindings_without_aliasing() {
    let mut m = no_aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let z = reg("z", 32);
    let w = reg("w", 32);
    let mx = mem(x.clone(), 32).unwrap();
    let my = mem(y.clone(), 32).unwrap();
    let mxx = mem(x.clone() + cst(2, 32), 32).unwrap();

    m.write(&mx, cst(0xdeadbeef, 32)).unwrap();
    m.write(&my, cst(0xbabebabe, 32)).unwrap();
    m.write(&mxx, cst(0x01234567, 32)).unwrap();
    m.write(&z, mem(w.clone(), 32).unwrap()).unwrap();

    let mut prev = no_aliasing();
    prev.write(&x, z.clone()).unwrap();
    prev.write(&y, z.clone()).unwrap();
    prev.write(&w, z.clone()).unwrap();

    let cm = m.compose(&prev).unwrap();
    // x and y are equal under prev, so [x] and [y] name the same cell
    assert_eq!(cm.eval(&mx).unwrap(), cst(0x4567babe, 32));
    assert_eq!(cm.eval(&my).unwrap(), cst(0x4567babe, 32));
    // no aliasing is assumed, so z takes [w] before this state's stores
    assert_eq!(cm.eval(&z).unwrap(), mem(z.clone(), 32).unwrap());
}

#[test]
fn composition_re_resolves_memory_under_aliasing() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let z = reg("z", 32);
    let w = reg("w", 32);
    let mx = mem(x.clone(), 32).unwrap();
    let my = mem(y.clone(), 32).unwrap();
    let mxx = mem(x.clone() + cst(2, 32), 32).unwrap();

    m.write(&mx, cst(0xdeadbeef, 32)).unwrap();
    m.write(&my, cst(0xbabebabe, 32)).unwrap();
    m.write(&mxx, cst(0x01234567, 32)).unwrap();
    m.write(&z, mem(w.clone(), 32).unwrap()).unwrap();
    m.write(&w, my.clone()).unwrap();

    let mut prev = aliasing();
    prev.write(&x, z.clone()).unwrap();
    prev.write(&y, z.clone()).unwrap();
    prev.write(&w, z.clone()).unwrap();

    let cm = m.compose(&prev).unwrap();
    assert_eq!(cm.eval(&mx).unwrap(), cst(0x4567babe, 32));
    assert_eq!(cm.eval(&my).unwrap(), cst(0x4567babe, 32));
    // aliasing is possible, so w takes [y] after both memory stores
    assert_eq!(cm.eval(&w).unwrap(), cm.eval(&my).unwrap());
}

#[test]
fn signedness_propagates_through_evaluation() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);

    m.write(&x, cst(0xffff_fffe, 32)).unwrap();
    assert_eq!(
        m.eval(&(x.clone() * cst(2, 32))).unwrap(),
        cst(0xffff_fffc, 32)
    );
    assert_eq!(
        m.eval(&(x.clone().signed() * cst(2, 32))).unwrap(),
        cst_s(-4, 32)
    );

    m.write(&y, cst_s(-2, 32)).unwrap();
    assert_eq!(m.eval(&(y.clone() * cst(2, 32))).unwrap(), cst_s(-4, 32));

    let y8 = y.slice(0, 8).unwrap();
    assert_eq!(m.eval(&y8).unwrap(), cst(0xfe, 8));
    assert_eq!(
        m.eval(&y8.clone().pow(cst(2, 8))).unwrap(),
        cst(0x1fc, 16)
    );

    let y8s = y8.signed();
    assert_eq!(m.eval(&(y8s.clone() * cst(2, 8))).unwrap(), cst_s(-4, 8));
    assert_eq!(m.eval(&y8s.pow(cst(2, 8))).unwrap(), cst_s(-4, 16));
}

#[test]
fn disjunctions_distribute_and_specialize() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);
    let z = reg("z", 32);
    let w = reg("w", 32);
    let a = reg("a", 32);
    let b = reg("b", 32);
    let mx = mem(x.clone(), 32).unwrap();

    m.write(
        &z,
        disj(vec![mx.clone(), y.clone(), w.clone(), cst(0x1000, 32)]),
    )
    .unwrap();
    m.write(&y, disj(vec![a.clone(), b.clone()])).unwrap();

    let yy = m.eval(&(y.clone() + y.clone())).unwrap().simplify();
    let cands = yy.candidates().expect("a disjunction");
    assert_eq!(cands.len(), 3);
    assert!(cands.contains(&(b.clone() + a.clone())));

    m.write(&a, z.clone() + y.clone()).unwrap();
    let mm = m.substitute(&[("a", cst(1, 32)), ("b", cst(1, 32))]);
    assert_eq!(
        mm.eval(&a).unwrap(),
        mm.eval(&(z.clone() + cst(1, 32))).unwrap()
    );
}

#[test]
fn substitution_binds_pointer_bases() {
    let mut m = aliasing();
    let x = reg("x", 32);
    let y = reg("y", 32);

    m.write(&y, mem(x.clone() + cst(12, 32), 32).unwrap())
        .unwrap();
    let mm = m.substitute(&[("x", cst(0x1000, 32))]);
    match mm.register("y") {
        Some(Expression::Mem { addr, .. }) => match &**addr {
            Expression::Ptr { base, disp } => {
                assert_eq!(**base, cst(0x1000, 32));
                assert_eq!(*disp, 12);
            }
            e => panic!("expected a pointer, got {}", e),
        },
        r => panic!("expected a memory read, got {:?}", r),
    }
}

#[test]
fn assumptions_fold_implied_bindings() {
    let mut m = aliasing();
    let r = reg("r", 32);
    let w = reg("w", 32);
    let x = reg("x", 32);
    let y = reg("y", 32);

    m.write(&r, w.clone() + cst(3, 32)).unwrap();
    let mm = m
        .assume(&[
            x.clone().cmpeq(cst(3, 32)),
            w.clone().cmpeq(cst(0, 32)),
            y.clone().cmpgt(cst(0, 32)),
        ])
        .unwrap();
    assert_eq!(mm.eval(&r).unwrap(), cst(3, 32));
    assert_eq!(mm.conds()[2], y.cmpgt(cst(0, 32)));
}

#[test]
fn merged_locations_keep_distinct_candidates_in_order() {
    let mut m1 = aliasing();
    let r = reg("r", 32);
    let w = reg("w", 32);
    let x = reg("x", 32);
    let y = reg("y", 32);
    let a = reg("a", 32);
    let b = reg("b", 32);

    m1.write(&r, w.clone() + cst(3, 32)).unwrap();
    let mm1 = m1
        .assume(&[
            x.clone().cmpeq(cst(3, 32)),
            w.clone().cmpeq(cst(0, 32)),
            y.clone().cmpgt(cst(0, 32)),
        ])
        .unwrap();

    let mut m2 = aliasing();
    m2.write(&r, a.clone() + b.clone()).unwrap();
    let mm2 = m2
        .assume(&[w.clone().cmpeq(cst(1, 32)), y.clone().cmplt(cst(0, 32))])
        .unwrap();

    let mm3 = merge(&[&mm1, &mm2]).unwrap();
    let rv = mm3.eval(&r).unwrap();
    let cands = rv.candidates().expect("a disjunction");
    assert_eq!(cands[0], cst(3, 32));
    assert_eq!(cands[1], a.clone() + b.clone());

    let mut m3 = aliasing();
    m3.write(&r, x.clone()).unwrap();
    m3.write(&w, cst(0x1000, 32)).unwrap();

    let mm4 = merge(&[&mm3, &m3]).unwrap();
    let wv = mm4.eval(&w).unwrap();
    let cands = wv.candidates().expect("a disjunction");
    assert!(cands.contains(&w));
    assert!(cands.contains(&cst(0x1000, 32)));

    // nesting the joins leaves the candidate set unchanged
    let direct = merge(&[&mm1, &mm2, &m3]).unwrap();
    let dr = direct.eval(&r).unwrap();
    let nr = mm4.eval(&r).unwrap();
    let dc = dr.candidates().expect("a disjunction");
    let nc = nr.candidates().expect("a disjunction");
    assert_eq!(dc.len(), nc.len());
    for c in dc {
        assert!(nc.contains(c));
    }
}

#[test]
fn serialized_states_answer_reads_identically() {
    let mut m = aliasing();
    let a = reg("a", 32);

    m.write(&a, a.clone() + cst(3, 32)).unwrap();
    m.write(
        &mem(a.clone(), 8).unwrap(),
        cst(1, 32).slice(0, 8).unwrap(),
    )
    .unwrap();
    m.add_cond(a.clone().cmpeq(cst(0, 32))).unwrap();

    let encoded = serde_json::to_string(&m).unwrap();
    let restored: State = serde_json::from_str(&encoded).unwrap();
    assert_eq!(restored, m);
    assert_eq!(restored.conds()[0], a.clone().cmpeq(cst(0, 32)));
    assert_eq!(restored.eval(&a).unwrap(), a.clone() + cst(3, 32));
    // the write log itself survives, not just resolved contents
    assert_eq!(restored.memory().writes().len(), 1);
    assert_eq!(
        restored.eval(&mem(a.clone(), 8).unwrap()).unwrap(),
        cst(1, 8)
    );
}
