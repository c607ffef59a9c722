//! G.711 Companding (ITU-T G.711, μ-law und A-law)
//!
//! Bit-genaue Umsetzung der Referenzalgorithmen. Wird nur von der
//! Tempo-Anpassung gebraucht – die Engine selbst spiegelt Codec-Bytes
//! unveraendert.

/// Komprimiert ein lineares 16-Bit-Sample nach A-law
pub fn alaw_kodieren(sample: i16) -> u8 {
    let mut ix = if sample < 0 {
        ((!sample) as u16 >> 4) as i16
    } else {
        sample >> 4
    };

    if ix > 15 {
        let mut exponent = 1;
        while ix > 16 + 15 {
            ix >>= 1;
            exponent += 1;
        }
        ix -= 16;
        ix += exponent << 4;
    }

    if sample >= 0 {
        ix |= 0x80;
    }
    (ix ^ 0x55) as u8
}

/// Expandiert ein A-law-Byte zu einem linearen 16-Bit-Sample
pub fn alaw_dekodieren(byte: u8) -> i16 {
    let ix = ((byte ^ 0x55) & 0x7F) as i16;
    let exponent = ix >> 4;
    let mut mantisse = ix & 0x0F;

    if exponent > 0 {
        mantisse += 16;
    }
    mantisse = (mantisse << 4) + 0x08;
    if exponent > 1 {
        mantisse <<= exponent - 1;
    }

    if byte > 127 {
        mantisse
    } else {
        -mantisse
    }
}

/// Komprimiert ein lineares 16-Bit-Sample nach μ-law
pub fn ulaw_kodieren(sample: i16) -> u8 {
    // 14 Bit Betrag plus Bias 33
    let betrag = if sample < 0 {
        ((!sample) as u16 >> 2) as i16 + 33
    } else {
        (sample >> 2) + 33
    };
    let betrag = betrag.min(0x1FFF);

    let mut rest = betrag >> 6;
    let mut segment = 1;
    while rest != 0 {
        segment += 1;
        rest >>= 1;
    }

    let oben = 0x08 - segment;
    let unten = 0x0F - ((betrag >> segment) & 0x0F);
    let mut ergebnis = (oben << 4) | unten;
    if sample >= 0 {
        ergebnis |= 0x80;
    }
    ergebnis as u8
}

/// Expandiert ein μ-law-Byte zu einem linearen 16-Bit-Sample
pub fn ulaw_dekodieren(byte: u8) -> i16 {
    let vorzeichen: i16 = if byte < 0x80 { -1 } else { 1 };
    let invertiert = (!byte) as i16;
    let exponent = (invertiert >> 4) & 0x07;
    let mantisse = invertiert & 0x0F;
    let schritt = 4 << (exponent + 1);

    vorzeichen * ((0x80 << exponent) + schritt * mantisse + schritt / 2 - 4 * 33)
}
