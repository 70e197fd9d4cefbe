//! Classic BPF programs attached to worker packet sockets.
//!
//! Offsets assume an Ethernet link layer (14 byte header).

use std::net::Ipv4Addr;

use crate::domain::{ETHERTYPE_ARP, ETHERTYPE_IP, FRAMELEN_MAX};

/// One classic BPF instruction, laid out like the kernel's `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<BpfInsn>() == 8);

// Instruction classes
pub(crate) const BPF_LD: u16 = 0x00;
pub(crate) const BPF_LDX: u16 = 0x01;
pub(crate) const BPF_JMP: u16 = 0x05;
pub(crate) const BPF_RET: u16 = 0x06;

// Sizes
pub(crate) const BPF_W: u16 = 0x00;
pub(crate) const BPF_H: u16 = 0x08;
pub(crate) const BPF_B: u16 = 0x10;

// Modes
pub(crate) const BPF_ABS: u16 = 0x20;
pub(crate) const BPF_IND: u16 = 0x40;
pub(crate) const BPF_MSH: u16 = 0xa0;

// Jumps
pub(crate) const BPF_JEQ: u16 = 0x10;
pub(crate) const BPF_JSET: u16 = 0x40;
pub(crate) const BPF_K: u16 = 0x00;

const ARPHRD_ETHER: u32 = 1;
const IPPROTO_UDP: u32 = 17;
const BOOTPC: u32 = 68;

/// Snap length returned for accepted frames.
const ACCEPT: u32 = FRAMELEN_MAX as u32;

fn insn(code: u16, jt: u8, jf: u8, k: u32) -> BpfInsn {
    BpfInsn { code, jt, jf, k }
}

/// Accept Ethernet ARP for IPv4.
///
/// With an address, only frames whose sender or target protocol address
/// equals it are accepted.
///
/// ```text
///   [0]  ldh  [12]             ; ethertype
///   [1]  jeq  #0x0806          ; ARP? else drop
///   [2]  ldh  [14]             ; hardware type
///   [3]  jeq  #1               ; Ethernet? else drop
///   [4]  ldh  [16]             ; protocol type
///   [5]  jeq  #0x0800          ; IPv4? else drop
///   [6]  ldb  [18]             ; hardware length
///   [7]  jeq  #6               ; else drop
///   [8]  ldb  [19]             ; protocol length
///   [9]  jeq  #4               ; else drop
///   --- with an address only ---
///   [10] ld   [28]             ; sender protocol address
///   [11] jeq  #addr, accept
///   [12] ld   [38]             ; target protocol address
///   [13] jeq  #addr, accept, drop
///   ---
///        ret  #snaplen         ; accept
///        ret  #0               ; drop
/// ```
pub fn arp_filter(addr: Option<Ipv4Addr>) -> Vec<BpfInsn> {
    // Distance from instruction [1] to the drop instruction grows by four
    // when the address checks are appended.
    let extra: u8 = if addr.is_some() { 4 } else { 0 };

    let mut prog = vec![
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 9 + extra, u32::from(ETHERTYPE_ARP)),
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 14),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 7 + extra, ARPHRD_ETHER),
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 16),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 5 + extra, u32::from(ETHERTYPE_IP)),
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 18),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 3 + extra, 6),
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 19),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1 + extra, 4),
    ];

    if let Some(addr) = addr {
        let k = u32::from(addr);
        prog.extend([
            insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, 28),
            insn(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, k),
            insn(BPF_LD | BPF_W | BPF_ABS, 0, 0, 38),
            insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, k),
        ]);
    }

    prog.push(insn(BPF_RET | BPF_K, 0, 0, ACCEPT));
    prog.push(insn(BPF_RET | BPF_K, 0, 0, 0));
    prog
}

/// Accept unfragmented IPv4 UDP to the BOOTP client port.
///
/// The address is ignored; BOOTP workers are keyed by interface only.
///
/// ```text
///   [0]  ldh  [12]             ; ethertype
///   [1]  jeq  #0x0800          ; IPv4? else drop
///   [2]  ldb  [23]             ; IP protocol
///   [3]  jeq  #17              ; UDP? else drop
///   [4]  ldh  [20]             ; flags + fragment offset
///   [5]  jset #0x1fff, drop    ; fragment? drop
///   [6]  ldx  4*([14]&0xf)     ; IP header length
///   [7]  ldh  [x+16]           ; UDP destination port
///   [8]  jeq  #68, accept, drop
///   [9]  ret  #snaplen
///   [10] ret  #0
/// ```
pub fn bootp_filter(_addr: Option<Ipv4Addr>) -> Vec<BpfInsn> {
    vec![
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 8, u32::from(ETHERTYPE_IP)),
        insn(BPF_LD | BPF_B | BPF_ABS, 0, 0, 23),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 6, IPPROTO_UDP),
        insn(BPF_LD | BPF_H | BPF_ABS, 0, 0, 20),
        insn(BPF_JMP | BPF_JSET | BPF_K, 4, 0, 0x1fff),
        insn(BPF_LDX | BPF_B | BPF_MSH, 0, 0, 14),
        insn(BPF_LD | BPF_H | BPF_IND, 0, 0, 16),
        insn(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, BOOTPC),
        insn(BPF_RET | BPF_K, 0, 0, ACCEPT),
        insn(BPF_RET | BPF_K, 0, 0, 0),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Run a program against a packet. Loads past the end reject the packet,
    /// matching the kernel.
    pub(crate) fn run(prog: &[BpfInsn], pkt: &[u8]) -> u32 {
        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut pc = 0usize;

        let load = |off: usize, size: u16| -> Option<u32> {
            match size {
                BPF_W => pkt
                    .get(off..off + 4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                BPF_H => pkt.get(off..off + 2).map(|b| u32::from(u16::from_be_bytes([b[0], b[1]]))),
                BPF_B => pkt.get(off).map(|&b| u32::from(b)),
                _ => None,
            }
        };

        while pc < prog.len() {
            let i = prog[pc];
            let class = i.code & 0x07;
            let size = i.code & 0x18;
            let mode = i.code & 0xe0;
            match class {
                BPF_LD => {
                    let off = match mode {
                        BPF_ABS => i.k as usize,
                        BPF_IND => (x + i.k) as usize,
                        _ => panic!("unsupported ld mode {:#x}", mode),
                    };
                    match load(off, size) {
                        Some(v) => a = v,
                        None => return 0,
                    }
                }
                BPF_LDX => {
                    assert_eq!(mode, BPF_MSH);
                    match pkt.get(i.k as usize) {
                        Some(&b) => x = 4 * u32::from(b & 0x0f),
                        None => return 0,
                    }
                }
                BPF_JMP => {
                    let taken = match i.code & 0xf0 {
                        BPF_JEQ => a == i.k,
                        BPF_JSET => a & i.k != 0,
                        op => panic!("unsupported jump {:#x}", op),
                    };
                    pc += if taken { i.jt as usize } else { i.jf as usize };
                }
                BPF_RET => return i.k,
                _ => panic!("unsupported class {:#x}", class),
            }
            pc += 1;
        }
        panic!("program fell off the end");
    }

    fn arp_frame(spa: [u8; 4], tpa: [u8; 4]) -> Vec<u8> {
        let mut f = vec![0u8; 42];
        f[0..6].copy_from_slice(&[0xff; 6]);
        f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        f[12..14].copy_from_slice(&[0x08, 0x06]);
        f[14..16].copy_from_slice(&[0x00, 0x01]);
        f[16..18].copy_from_slice(&[0x08, 0x00]);
        f[18] = 6;
        f[19] = 4;
        f[20..22].copy_from_slice(&[0x00, 0x01]);
        f[28..32].copy_from_slice(&spa);
        f[38..42].copy_from_slice(&tpa);
        f
    }

    fn udp_frame(dst_port: u16, frag: u16) -> Vec<u8> {
        let mut f = vec![0u8; 14 + 20 + 8 + 240];
        f[12..14].copy_from_slice(&[0x08, 0x00]);
        f[14] = 0x45;
        f[20..22].copy_from_slice(&frag.to_be_bytes());
        f[23] = 17;
        f[34..36].copy_from_slice(&67u16.to_be_bytes());
        f[36..38].copy_from_slice(&dst_port.to_be_bytes());
        f
    }

    #[test]
    fn test_arp_filter_accepts_arp() {
        let prog = arp_filter(None);
        assert_eq!(prog.len(), 12);
        assert_eq!(run(&prog, &arp_frame([192, 0, 2, 1], [192, 0, 2, 9])), ACCEPT);
    }

    #[test]
    fn test_arp_filter_rejects_ip_and_short() {
        let prog = arp_filter(None);
        assert_eq!(run(&prog, &udp_frame(68, 0)), 0);
        assert_eq!(run(&prog, &arp_frame([0; 4], [0; 4])[..18]), 0);
    }

    #[test]
    fn test_arp_filter_with_address() {
        let addr = Ipv4Addr::new(192, 0, 2, 5);
        let prog = arp_filter(Some(addr));
        assert_eq!(prog.len(), 16);

        // probe for our address
        assert_eq!(run(&prog, &arp_frame([0; 4], [192, 0, 2, 5])), ACCEPT);
        // announcement from our address
        assert_eq!(run(&prog, &arp_frame([192, 0, 2, 5], [192, 0, 2, 5])), ACCEPT);
        // unrelated traffic
        assert_eq!(run(&prog, &arp_frame([192, 0, 2, 1], [192, 0, 2, 9])), 0);
    }

    #[test]
    fn test_bootp_filter() {
        let prog = bootp_filter(None);
        assert_eq!(run(&prog, &udp_frame(68, 0)), ACCEPT);
        assert_eq!(run(&prog, &udp_frame(67, 0)), 0);
        // fragments are dropped
        assert_eq!(run(&prog, &udp_frame(68, 0x0010)), 0);
        // don't-fragment bit alone is fine
        assert_eq!(run(&prog, &udp_frame(68, 0x4000)), ACCEPT);
        assert_eq!(run(&prog, &arp_frame([0; 4], [0; 4])), 0);
    }

    #[test]
    fn test_bootp_filter_with_ip_options() {
        let mut f = vec![0u8; 14 + 24 + 8 + 240];
        f[12..14].copy_from_slice(&[0x08, 0x00]);
        f[14] = 0x46;
        f[23] = 17;
        f[40..42].copy_from_slice(&68u16.to_be_bytes());
        assert_eq!(run(&bootp_filter(None), &f), ACCEPT);
    }
}
