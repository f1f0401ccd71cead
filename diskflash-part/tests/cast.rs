#[test]
fn num_cast() {
    assert_eq!(diskflash_part::num_cast!(u64, 42_usize), 42_u64);
}

#[test]
#[should_panic]
fn num_cast_overflow() {
    diskflash_part::num_cast!(u32, u64::from(u32::MAX) + 1);
}

#[test]
#[should_panic]
fn num_cast_underflow() {
    diskflash_part::num_cast!(u32, -1_i32);
}
