//! Integration tests for the cache slot manager and paged pool.

use multi_lora::config::CacheConfig;
use multi_lora::core::cache::{CachePool, CacheSlotManager};
use multi_lora::core::PagedKvPool;
use multi_lora::Error;

#[test]
fn test_pool_from_config() {
    let config = CacheConfig {
        page_len: 8,
        num_pages: 10,
    };
    let pool = PagedKvPool::from_config(&config).unwrap();

    assert_eq!(pool.page_len(), 8);
    assert_eq!(pool.num_pages(), 10);
    assert_eq!(pool.num_free_pages(), 10);
    assert_eq!(config.capacity(), 80);
}

#[test]
fn test_pool_from_config_rejects_zero_page_len() {
    let config = CacheConfig {
        page_len: 0,
        num_pages: 10,
    };

    assert!(matches!(
        PagedKvPool::from_config(&config),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_slots_are_independent() {
    let mut manager = CacheSlotManager::new(PagedKvPool::new(8, 4).unwrap());
    let mut a = manager.acquire(3).unwrap();
    let mut b = manager.acquire(6).unwrap();
    assert_ne!(a.id(), b.id());

    manager.extend_by_one(&mut a).unwrap();
    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 6);
    assert_eq!(manager.pool().slot_len(b.id()), Some(6));

    manager.release(&mut a).unwrap();
    assert_eq!(manager.pool().slot_len(a.id()), None);
    assert_eq!(manager.live_slots(), 1);
    manager.release(&mut b).unwrap();
    assert_eq!(manager.pool().num_free_pages(), 8);
}

#[test]
fn test_released_pages_are_reused() {
    let mut manager = CacheSlotManager::new(PagedKvPool::new(2, 4).unwrap());
    let mut a = manager.acquire(8).unwrap();
    assert!(matches!(manager.acquire(1), Err(Error::CacheExhausted(_))));

    manager.release(&mut a).unwrap();
    let b = manager.acquire(5).unwrap();
    assert_eq!(manager.pool().page_table(b.id()).map(<[usize]>::len), Some(2));
}

#[test]
fn test_can_extend_all_checks_combined_demand() {
    let mut manager = CacheSlotManager::new(PagedKvPool::new(4, 4).unwrap());
    let a = manager.acquire(4).unwrap();
    let b = manager.acquire(4).unwrap();
    let c = manager.acquire(2).unwrap();

    // One page left: a and b each need a fresh page, c still has room
    assert!(manager.can_extend_all([&a, &c]));
    assert!(!manager.can_extend_all([&a, &b]));
}

#[test]
fn test_pool_rejects_unknown_slots() {
    let mut pool = PagedKvPool::new(2, 4).unwrap();
    assert!(matches!(pool.extend(99), Err(Error::SlotReleased(99))));
    assert!(matches!(pool.release(99), Err(Error::DoubleRelease(99))));
}
