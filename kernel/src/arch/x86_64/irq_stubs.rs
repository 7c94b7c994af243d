// Stubs for vectors 32-255, expanded by the irq_stubs! macro in idt.rs.

irq_stubs! {
    (irq_32_handler, 32),
    (irq_33_handler, 33),
    (irq_34_handler, 34),
    (irq_35_handler, 35),
    (irq_36_handler, 36),
    (irq_37_handler, 37),
    (irq_38_handler, 38),
    (irq_39_handler, 39),
    (irq_40_handler, 40),
    (irq_41_handler, 41),
    (irq_42_handler, 42),
    (irq_43_handler, 43),
    (irq_44_handler, 44),
    (irq_45_handler, 45),
    (irq_46_handler, 46),
    (irq_47_handler, 47),
    (irq_48_handler, 48),
    (irq_49_handler, 49),
    (irq_50_handler, 50),
    (irq_51_handler, 51),
    (irq_52_handler, 52),
    (irq_53_handler, 53),
    (irq_54_handler, 54),
    (irq_55_handler, 55),
    (irq_56_handler, 56),
    (irq_57_handler, 57),
    (irq_58_handler, 58),
    (irq_59_handler, 59),
    (irq_60_handler, 60),
    (irq_61_handler, 61),
    (irq_62_handler, 62),
    (irq_63_handler, 63),
    (irq_64_handler, 64),
    (irq_65_handler, 65),
    (irq_66_handler, 66),
    (irq_67_handler, 67),
    (irq_68_handler, 68),
    (irq_69_handler, 69),
    (irq_70_handler, 70),
    (irq_71_handler, 71),
    (irq_72_handler, 72),
    (irq_73_handler, 73),
    (irq_74_handler, 74),
    (irq_75_handler, 75),
    (irq_76_handler, 76),
    (irq_77_handler, 77),
    (irq_78_handler, 78),
    (irq_79_handler, 79),
    (irq_80_handler, 80),
    (irq_81_handler, 81),
    (irq_82_handler, 82),
    (irq_83_handler, 83),
    (irq_84_handler, 84),
    (irq_85_handler, 85),
    (irq_86_handler, 86),
    (irq_87_handler, 87),
    (irq_88_handler, 88),
    (irq_89_handler, 89),
    (irq_90_handler, 90),
    (irq_91_handler, 91),
    (irq_92_handler, 92),
    (irq_93_handler, 93),
    (irq_94_handler, 94),
    (irq_95_handler, 95),
    (irq_96_handler, 96),
    (irq_97_handler, 97),
    (irq_98_handler, 98),
    (irq_99_handler, 99),
    (irq_100_handler, 100),
    (irq_101_handler, 101),
    (irq_102_handler, 102),
    (irq_103_handler, 103),
    (irq_104_handler, 104),
    (irq_105_handler, 105),
    (irq_106_handler, 106),
    (irq_107_handler, 107),
    (irq_108_handler, 108),
    (irq_109_handler, 109),
    (irq_110_handler, 110),
    (irq_111_handler, 111),
    (irq_112_handler, 112),
    (irq_113_handler, 113),
    (irq_114_handler, 114),
    (irq_115_handler, 115),
    (irq_116_handler, 116),
    (irq_117_handler, 117),
    (irq_118_handler, 118),
    (irq_119_handler, 119),
    (irq_120_handler, 120),
    (irq_121_handler, 121),
    (irq_122_handler, 122),
    (irq_123_handler, 123),
    (irq_124_handler, 124),
    (irq_125_handler, 125),
    (irq_126_handler, 126),
    (irq_127_handler, 127),
    (irq_128_handler, 128),
    (irq_129_handler, 129),
    (irq_130_handler, 130),
    (irq_131_handler, 131),
    (irq_132_handler, 132),
    (irq_133_handler, 133),
    (irq_134_handler, 134),
    (irq_135_handler, 135),
    (irq_136_handler, 136),
    (irq_137_handler, 137),
    (irq_138_handler, 138),
    (irq_139_handler, 139),
    (irq_140_handler, 140),
    (irq_141_handler, 141),
    (irq_142_handler, 142),
    (irq_143_handler, 143),
    (irq_144_handler, 144),
    (irq_145_handler, 145),
    (irq_146_handler, 146),
    (irq_147_handler, 147),
    (irq_148_handler, 148),
    (irq_149_handler, 149),
    (irq_150_handler, 150),
    (irq_151_handler, 151),
    (irq_152_handler, 152),
    (irq_153_handler, 153),
    (irq_154_handler, 154),
    (irq_155_handler, 155),
    (irq_156_handler, 156),
    (irq_157_handler, 157),
    (irq_158_handler, 158),
    (irq_159_handler, 159),
    (irq_160_handler, 160),
    (irq_161_handler, 161),
    (irq_162_handler, 162),
    (irq_163_handler, 163),
    (irq_164_handler, 164),
    (irq_165_handler, 165),
    (irq_166_handler, 166),
    (irq_167_handler, 167),
    (irq_168_handler, 168),
    (irq_169_handler, 169),
    (irq_170_handler, 170),
    (irq_171_handler, 171),
    (irq_172_handler, 172),
    (irq_173_handler, 173),
    (irq_174_handler, 174),
    (irq_175_handler, 175),
    (irq_176_handler, 176),
    (irq_177_handler, 177),
    (irq_178_handler, 178),
    (irq_179_handler, 179),
    (irq_180_handler, 180),
    (irq_181_handler, 181),
    (irq_182_handler, 182),
    (irq_183_handler, 183),
    (irq_184_handler, 184),
    (irq_185_handler, 185),
    (irq_186_handler, 186),
    (irq_187_handler, 187),
    (irq_188_handler, 188),
    (irq_189_handler, 189),
    (irq_190_handler, 190),
    (irq_191_handler, 191),
    (irq_192_handler, 192),
    (irq_193_handler, 193),
    (irq_194_handler, 194),
    (irq_195_handler, 195),
    (irq_196_handler, 196),
    (irq_197_handler, 197),
    (irq_198_handler, 198),
    (irq_199_handler, 199),
    (irq_200_handler, 200),
    (irq_201_handler, 201),
    (irq_202_handler, 202),
    (irq_203_handler, 203),
    (irq_204_handler, 204),
    (irq_205_handler, 205),
    (irq_206_handler, 206),
    (irq_207_handler, 207),
    (irq_208_handler, 208),
    (irq_209_handler, 209),
    (irq_210_handler, 210),
    (irq_211_handler, 211),
    (irq_212_handler, 212),
    (irq_213_handler, 213),
    (irq_214_handler, 214),
    (irq_215_handler, 215),
    (irq_216_handler, 216),
    (irq_217_handler, 217),
    (irq_218_handler, 218),
    (irq_219_handler, 219),
    (irq_220_handler, 220),
    (irq_221_handler, 221),
    (irq_222_handler, 222),
    (irq_223_handler, 223),
    (irq_224_handler, 224),
    (irq_225_handler, 225),
    (irq_226_handler, 226),
    (irq_227_handler, 227),
    (irq_228_handler, 228),
    (irq_229_handler, 229),
    (irq_230_handler, 230),
    (irq_231_handler, 231),
    (irq_232_handler, 232),
    (irq_233_handler, 233),
    (irq_234_handler, 234),
    (irq_235_handler, 235),
    (irq_236_handler, 236),
    (irq_237_handler, 237),
    (irq_238_handler, 238),
    (irq_239_handler, 239),
    (irq_240_handler, 240),
    (irq_241_handler, 241),
    (irq_242_handler, 242),
    (irq_243_handler, 243),
    (irq_244_handler, 244),
    (irq_245_handler, 245),
    (irq_246_handler, 246),
    (irq_247_handler, 247),
    (irq_248_handler, 248),
    (irq_249_handler, 249),
    (irq_250_handler, 250),
    (irq_251_handler, 251),
    (irq_252_handler, 252),
    (irq_253_handler, 253),
    (irq_254_handler, 254),
    (irq_255_handler, 255),
}
