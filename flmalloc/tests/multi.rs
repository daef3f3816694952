use std::{alloc::Layout, collections::BTreeSet, mem, ops, ptr::NonNull, sync};

use serial_test::serial;

use flmalloc::FlAllocator;
use flmalloc_test::{Pool, RendezVous};

static FL_ALLOCATOR: FlAllocator = FlAllocator::new();

//
//  Tests
//

#[serial]
#[test]
fn concurrent_first_touch() {
    //  Test that the very first touch of the allocator may race: all threads attempt the lazy initialization
    //  simultaneously, and every one of them must come out with a working allocator.

    let number_threads = number_threads();

    let start = RendezVous::new("start", number_threads);
    let end = RendezVous::new("end", number_threads);

    let pool = Pool::new(number_threads, |i| {
        let start = start.clone();
        let end = end.clone();

        move || {
            start.wait_until_all_ready();

            FL_ALLOCATOR.warm_up().expect("Warmed up");

            let pointer = Pointer::new(i);

            end.wait_until_all_ready();

            //  Sanity check, to ensure no two threads were handed the same block.
            assert_eq!(i, *pointer);
        }
    });

    pool.join();
}

#[serial]
#[test]
fn concurrent_allocation_burst() {
    //  Test that a synchronized burst of allocations hands out pairwise distinct blocks.

    let number_iterations = number_iterations();
    let number_threads = number_threads();
    let number_victims = 64;

    for _ in 0..number_iterations {
        let start = RendezVous::new("start", number_threads);

        let pool = Pool::new(number_threads, |_| {
            let start = start.clone();

            move || {
                FL_ALLOCATOR.warm_up().expect("Warmed up");

                start.wait_until_all_ready();

                let batch: Vec<_> = (0..number_victims).map(|i| Pointer::new(i.to_string())).collect();

                batch.iter().map(|pointer| pointer.address()).collect::<Vec<_>>()
            }
        });

        let mut addresses = BTreeSet::new();

        for thread_addresses in pool.join() {
            for address in thread_addresses {
                assert!(addresses.insert(address), "{:x} handed out twice", address);
            }
        }
    }
}

#[serial]
#[test]
fn cross_thread_ring() {
    //  Test that blocks can be concurrently allocated and deallocated, including deallocated on a separate thread.
    //
    //  A high-level overview:
    //
    //  1.  "Victims" are prepared, those are numbers 0 to N made into `String`.
    //  2.  Concurrently (synchronized) those victims are moved into `Pointer`, each requiring an allocation.
    //  3.  The ring of vectors is rotated by one slot, so each thread now holds pointers allocated by its neighbour.
    //  4.  Concurrently (synchronized) those rotated pointers are freed, and their values recovered.
    //  5.  Check the recovered values match the originals, to ensure no corruption occurred.
    //  6.  The rendez-vous are reset, for the next iteration.

    fn create_victims(number: usize) -> Vec<String> { (0..number).map(|i| i.to_string()).collect() }

    fn push_victims(victims: Vec<String>, sink: &mut Vec<Pointer<String>>) {
        debug_assert!(sink.is_empty());

        for victim in victims {
            sink.push(Pointer::new(victim));
        }
    }

    fn pop_victims(stream: &mut Vec<Pointer<String>>, sink: &mut Vec<String>) {
        stream.drain(..)
            .for_each(|mut pointer| sink.push(pointer.replace_with_default()));
    }

    //  Rotates the ring by one slot; slot 0 receives slot 1's vector, and so on.
    fn rotate_ring(ring: &[sync::Mutex<Vec<Pointer<String>>>]) {
        let mut guards: Vec<_> = ring.iter().map(|mutex| mutex.try_lock().unwrap()).collect();

        for i in 1..guards.len() {
            let (head, tail) = guards.split_at_mut(i);

            mem::swap(&mut *head[0], &mut *tail[0]);
        }
    }

    let number_iterations = number_iterations();
    let number_threads = number_threads();
    let number_victims = 256;

    let allocation = RendezVous::new("allocation", number_threads);
    let rotation_start = RendezVous::new("rotation-start", number_threads);
    let rotation_end = RendezVous::new("rotation-end", number_threads);
    let deallocation = RendezVous::new("deallocation", number_threads);
    let next = RendezVous::new("next", 0);

    let ring = {
        let mut ring = Vec::with_capacity(number_threads);
        ring.resize_with(number_threads, || sync::Mutex::new(vec!()));

        sync::Arc::new(ring)
    };

    let pool = Pool::new(number_threads, |thread_index| {
        let allocation = allocation.clone();
        let rotation_start = rotation_start.clone();
        let rotation_end = rotation_end.clone();
        let deallocation = deallocation.clone();
        let next = next.clone();
        let ring = ring.clone();

        move || {
            FL_ALLOCATOR.warm_up().expect("Warmed up");

            let custodian = thread_index == 0;

            for iteration in 0..number_iterations {
                //  Prepare batch of victims.
                let victims = create_victims(number_victims);

                //  Move victims to the vector of Pointers, which requires allocation.
                {
                    //  Pre-acquire guard to avoid delaying the start for unrelated reasons.
                    let mut sink = ring[thread_index].try_lock().unwrap();

                    allocation.wait_until_all_ready();

                    push_victims(victims, &mut *sink);
                }

                //  Rearm next iteration.
                if custodian {
                    next.reset(number_threads);
                }

                rotation_start.wait_until_all_ready();

                if custodian {
                    allocation.reset(number_threads);
                }

                //  Rotate the pointers.
                if custodian {
                    rotate_ring(&*ring);
                }

                rotation_end.wait_until_all_ready();

                if custodian {
                    rotation_start.reset(number_threads);
                }

                //  Deallocate the pointers, recover the victims.
                let victims = {
                    //  Pre-acquire guard to avoid delaying the start for unrelated reasons.
                    let mut stream = ring[thread_index].try_lock().unwrap();
                    let mut victims = Vec::with_capacity(stream.len());

                    deallocation.wait_until_all_ready();

                    pop_victims(&mut *stream, &mut victims);

                    victims
                };

                for (index, victim) in victims.into_iter().enumerate() {
                    assert_eq!(Ok(index), victim.parse(),
                        "thread {}, iteration {}, index {}, victim {:?}", thread_index, iteration, index, victim);
                }

                if custodian {
                    rotation_end.reset(number_threads);
                }

                next.wait_until_all_ready();

                if custodian {
                    deallocation.reset(number_threads);
                }
            }
        }
    });

    pool.join();
}

//
//  Implementation Details
//

fn number_iterations() -> usize { read_number_from_environment("FLMALLOC_MULTI_NUMBER_ITERATIONS", 10) }

fn number_threads() -> usize {
    let default = std::cmp::max(2, std::cmp::min(4, num_cpus::get()));

    read_number_from_environment("FLMALLOC_MULTI_NUMBER_THREADS", default)
}

fn read_number_from_environment(name: &str, default: usize) -> usize {
    for (n, value) in std::env::vars() {
        if n == name {
            if let Ok(result) = value.parse() {
                println!("read_number_from_environment - {}: {}", name, result);
                return result;
            }
        }
    }

    println!("read_number_from_environment - {}: {} (default)", name, default);
    default
}

struct Pointer<T> {
    pointer: NonNull<T>,
}

impl<T> Pointer<T> {
    fn new(value: T) -> Self {
        let layout = Layout::new::<T>();
        let pointer = FL_ALLOCATOR.allocate(layout).expect("Allocated").cast::<T>();

        unsafe { std::ptr::write(pointer.as_ptr(), value) }

        Pointer { pointer }
    }

    fn address(&self) -> usize { self.pointer.as_ptr() as usize }

    fn replace_with_default(&mut self) -> T
        where
            T: Default,
    {
        mem::replace(&mut *self, T::default())
    }
}

impl<T> Default for Pointer<T>
    where
        T: Default,
{
    fn default() -> Self { Self::new(T::default()) }
}

impl<T> Drop for Pointer<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(self.pointer.as_ptr());
            FL_ALLOCATOR.deallocate(self.pointer.cast());
        }
    }
}

impl<T> ops::Deref for Pointer<T> {
    type Target = T;

    fn deref(&self) -> &T { unsafe { self.pointer.as_ref() } }
}

impl<T> ops::DerefMut for Pointer<T> {
    fn deref_mut(&mut self) -> &mut T { unsafe { self.pointer.as_mut() } }
}

unsafe impl<T> Send for Pointer<T>
    where
        T: Send,
{}
